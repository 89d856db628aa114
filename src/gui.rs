// src/gui.rs
use crate::channel::Outbound;
use crate::clock::Clock;
use crate::protocol::{CellPosition, ColorTable, CommandProbability, Envelope, Matrix};
use crate::surface::SurfaceEvent;
use crate::types::Highlight;
use eframe::egui;
use egui::{Align2, Color32, FontId, Pos2, Rect, Rounding, Stroke, Vec2};
use log::{debug, error};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Instant;

const MIN_SEPARATOR: f32 = 20.0;
const RESULT_BOX_HEIGHT: f32 = 64.0;
const PHOTODIODE_SIZE: f32 = 60.0;

const DEFAULT_BACKGROUND: Color32 = Color32::from_rgb(20, 20, 20);
const DEFAULT_BOX: Color32 = Color32::from_rgb(60, 60, 60);
const DEFAULT_TEXT: Color32 = Color32::WHITE;

/// `#RRGGBB`, `0xRRGGBB` or `RRGGBBAA`.
pub fn parse_hex_color(hex: &str) -> Option<Color32> {
    let hex = hex.trim().trim_start_matches('#').trim_start_matches("0x");
    if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
        return None;
    }
    let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    let (r, g, b) = (byte(0)?, byte(2)?, byte(4)?);
    let a = if hex.len() == 8 { byte(6)? } else { 255 };
    Some(Color32::from_rgba_unmultiplied(r, g, b, a))
}

fn color_or(hex: Option<&str>, fallback: Color32) -> Color32 {
    hex.and_then(parse_hex_color).unwrap_or(fallback)
}

/// Square cells, row-major, centred in `area` with at least `MIN_SEPARATOR`
/// between them. The spare space goes to whichever axis has more of it.
pub fn layout_cells(area: Rect, n_row: usize, n_col: usize) -> Vec<Rect> {
    if n_row == 0 || n_col == 0 {
        return Vec::new();
    }
    let (rows, cols) = (n_row as f32, n_col as f32);
    let (width, height) = (area.width(), area.height());
    let h = (height - (rows + 1.0) * MIN_SEPARATOR) / rows;
    let w = (width - (cols + 1.0) * MIN_SEPARATOR) / cols;
    let size = w.min(h).max(1.0);
    let mut col_sep = MIN_SEPARATOR;
    let mut row_sep = MIN_SEPARATOR;
    if height < width {
        col_sep = (width - size * cols) / (cols + 1.0);
    } else {
        row_sep = (height - size * rows) / (rows + 1.0);
    }
    let x0 = area.left() + (width - (size * cols + col_sep * (cols - 1.0))) / 2.0;
    let y0 = area.top() + (height - (size * rows + row_sep * (rows - 1.0))) / 2.0;
    let mut cells = Vec::with_capacity(n_row * n_col);
    for r in 0..n_row {
        for c in 0..n_col {
            let min = Pos2::new(
                x0 + c as f32 * (size + col_sep),
                y0 + r as f32 * (size + row_sep),
            );
            cells.push(Rect::from_min_size(min, Vec2::splat(size)));
        }
    }
    cells
}

/// Pixel centres reported to the controller in `resize`.
pub fn cell_positions(matrix: &Matrix, cells: &[Rect]) -> Vec<CellPosition> {
    matrix
        .item_list
        .iter()
        .zip(cells)
        .enumerate()
        .map(|(idx, (cell, rect))| CellPosition {
            idx,
            coords: [0, cell.row, cell.col],
            position: [rect.center().x.round() as i32, rect.center().y.round() as i32],
        })
        .collect()
}

pub fn fps_label(render_fps: f32, fixed_fps: f32) -> String {
    format!("{:.0} fps (@{:.0})", render_fps, fixed_fps)
}

/// Everything the window shows, rebuilt from `SurfaceEvent`s.
#[derive(Default)]
pub struct SpellerView {
    matrix: Option<Matrix>,
    colors: ColorTable,
    photodiode_enabled: bool,
    photodiode_on: bool,
    codes: Vec<Option<i32>>,
    highlights: Vec<Option<Highlight>>,
    banner: String,
    results: String,
    tick_rate: Option<(f32, f32)>,
    probabilities: Vec<CommandProbability>,
    closed: bool,
}

impl SpellerView {
    pub fn apply(&mut self, event: SurfaceEvent) {
        match event {
            SurfaceEvent::LoadMatrix {
                matrix,
                colors,
                photodiode,
            } => {
                let n = matrix.item_list.len();
                self.codes = vec![None; n];
                self.highlights = vec![None; n];
                self.matrix = Some(matrix);
                self.colors = colors;
                self.photodiode_enabled = photodiode;
                self.probabilities.clear();
            }
            SurfaceEvent::InformationText(text) => self.banner = text,
            SurfaceEvent::Codes(codes) => {
                for (slot, code) in self.codes.iter_mut().zip(codes) {
                    *slot = Some(code);
                }
            }
            SurfaceEvent::Highlight { row, col, kind } => {
                if let Some(i) = self.index(row, col) {
                    self.highlights[i] = Some(kind);
                }
            }
            SurfaceEvent::Unhighlight { row, col } => {
                if let Some(i) = self.index(row, col) {
                    self.highlights[i] = None;
                }
            }
            SurfaceEvent::ResetCells => {
                self.codes.iter_mut().for_each(|c| *c = None);
                self.highlights.iter_mut().for_each(|h| *h = None);
            }
            SurfaceEvent::AppendResult(text) => {
                self.results.push_str(&text);
                self.results.push(' ');
            }
            SurfaceEvent::Photodiode(on) => self.photodiode_on = on,
            SurfaceEvent::TickRate { measured, configured } => self.tick_rate = Some((measured, configured)),
            SurfaceEvent::Probabilities(list) => self.probabilities = list,
            SurfaceEvent::Closed => self.closed = true,
        }
    }

    fn index(&self, row: usize, col: usize) -> Option<usize> {
        let matrix = self.matrix.as_ref()?;
        matrix.cell(row, col)?;
        Some(matrix.index(row, col))
    }

    fn box_color(&self, i: usize) -> Color32 {
        match self.highlights.get(i).copied().flatten() {
            Some(Highlight::Target) => color_or(self.colors.color_target_box.as_deref(), Color32::from_rgb(0, 160, 255)),
            Some(Highlight::Result) => {
                color_or(self.colors.color_highlight_result_box.as_deref(), Color32::from_rgb(0, 200, 80))
            }
            None => {
                let code = self.codes.get(i).copied().flatten().unwrap_or(0);
                color_or(self.colors.box_for(code), DEFAULT_BOX)
            }
        }
    }

    fn text_color(&self, i: usize) -> Color32 {
        let code = self.codes.get(i).copied().flatten().unwrap_or(0);
        color_or(self.colors.text_for(code), DEFAULT_TEXT)
    }

    fn probability(&self, row: usize, col: usize) -> Option<f32> {
        self.probabilities
            .iter()
            .find(|p| p.n_matrix == 0 && p.n_row == row && p.n_col == col)
            .map(|p| p.prob)
    }
}

pub struct SpellerApp {
    view: SpellerView,
    rx: Receiver<SurfaceEvent>,
    channel: Arc<dyn Outbound>,
    clock: Arc<dyn Clock>,

    // 渲染帧率统计
    frames: u32,
    fps_window: Instant,
    render_fps: f32,

    reported_layout: Option<(Vec2, usize, usize)>,
}

impl SpellerApp {
    pub fn new(rx: Receiver<SurfaceEvent>, channel: Arc<dyn Outbound>, clock: Arc<dyn Clock>) -> Self {
        Self {
            view: SpellerView::default(),
            rx,
            channel,
            clock,
            frames: 0,
            fps_window: Instant::now(),
            render_fps: 0.0,
            reported_layout: None,
        }
    }

    fn count_frame(&mut self) {
        self.frames += 1;
        let elapsed = self.fps_window.elapsed().as_secs_f32();
        if elapsed >= 1.0 {
            self.render_fps = self.frames as f32 / elapsed;
            self.frames = 0;
            self.fps_window = Instant::now();
        }
    }

    fn report_layout(&mut self, screen: Vec2, cells: &[Rect]) {
        let Some(matrix) = self.view.matrix.as_ref() else {
            return;
        };
        let key = (screen, matrix.n_row, matrix.n_col);
        if self.reported_layout == Some(key) {
            return;
        }
        self.reported_layout = Some(key);
        let positions = cell_positions(matrix, cells);
        let envelope = Envelope::resize(
            self.clock.unix_seconds(),
            [screen.x.round() as u32, screen.y.round() as u32],
            &positions,
        );
        debug!("window {}x{}, reporting {} cell centres", screen.x, screen.y, positions.len());
        if let Err(e) = self.channel.send(&envelope) {
            error!("failed to report resize: {}", e);
        }
    }

    fn draw(&self, ui: &mut egui::Ui) -> (Vec2, Vec<Rect>) {
        let view = &self.view;
        let painter = ui.painter();
        let full = ui.max_rect();

        // 1. 结果栏
        let result_rect = Rect::from_min_size(full.min, Vec2::new(full.width(), RESULT_BOX_HEIGHT));
        painter.rect_filled(
            result_rect,
            Rounding::ZERO,
            color_or(view.colors.color_result_info_box.as_deref(), Color32::from_rgb(35, 35, 35)),
        );
        painter.text(
            result_rect.left_center() + Vec2::new(16.0, 0.0),
            Align2::LEFT_CENTER,
            "Result:",
            FontId::proportional(22.0),
            color_or(view.colors.color_result_info_label.as_deref(), Color32::GRAY),
        );
        painter.text(
            result_rect.left_center() + Vec2::new(110.0, 0.0),
            Align2::LEFT_CENTER,
            view.results.trim_end(),
            FontId::proportional(26.0),
            color_or(view.colors.color_result_info_text.as_deref(), Color32::WHITE),
        );

        // 2. 指令矩阵
        let area = Rect::from_min_max(Pos2::new(full.left(), result_rect.bottom()), full.max);
        let mut cells = Vec::new();
        if let Some(matrix) = view.matrix.as_ref() {
            cells = layout_cells(area, matrix.n_row, matrix.n_col);
            for (i, (cell, rect)) in matrix.item_list.iter().zip(&cells).enumerate() {
                painter.rect_filled(*rect, Rounding::same(6.0), view.box_color(i));
                painter.text(
                    rect.center(),
                    Align2::CENTER_CENTER,
                    &cell.text,
                    FontId::proportional(rect.height() * 0.4),
                    view.text_color(i),
                );
                if let Some(prob) = view.probability(cell.row, cell.col) {
                    painter.text(
                        rect.right_bottom() - Vec2::splat(4.0),
                        Align2::RIGHT_BOTTOM,
                        format!("{:.2}", prob),
                        FontId::monospace(12.0),
                        Color32::YELLOW,
                    );
                }
            }
        }

        // 3. 提示框
        if !view.banner.is_empty() {
            let banner = Rect::from_center_size(area.center(), Vec2::new(area.width() * 0.5, 90.0));
            painter.rect_filled(banner, Rounding::same(8.0), Color32::from_black_alpha(220));
            painter.rect_stroke(banner, Rounding::same(8.0), Stroke::new(1.0, Color32::GRAY));
            painter.text(
                banner.center(),
                Align2::CENTER_CENTER,
                &view.banner,
                FontId::proportional(36.0),
                Color32::WHITE,
            );
        }

        // 4. 光电二极管方块
        if view.photodiode_enabled {
            let rect = Rect::from_min_size(
                Pos2::new(full.left(), full.bottom() - PHOTODIODE_SIZE),
                Vec2::splat(PHOTODIODE_SIZE),
            );
            let fill = if view.photodiode_on { Color32::WHITE } else { Color32::BLACK };
            painter.rect_filled(rect, Rounding::ZERO, fill);
        }

        // 5. 帧率监视
        let fixed = view.tick_rate.map(|(measured, _)| measured).unwrap_or(0.0);
        let good = view.tick_rate.map_or(true, |(measured, configured)| measured.round() >= configured);
        let fps_color = if good {
            color_or(view.colors.color_fps_good.as_deref(), Color32::GREEN)
        } else {
            color_or(view.colors.color_fps_bad.as_deref(), Color32::RED)
        };
        painter.text(
            full.right_bottom() - Vec2::new(10.0, 6.0),
            Align2::RIGHT_BOTTOM,
            fps_label(self.render_fps, fixed),
            FontId::monospace(14.0),
            fps_color,
        );

        (full.size(), cells)
    }
}

impl eframe::App for SpellerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // 1. 引擎消息
        while let Ok(event) = self.rx.try_recv() {
            self.view.apply(event);
        }
        if self.view.closed {
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
        }

        self.count_frame();
        ctx.request_repaint();

        // 2. 绘制
        let background = color_or(self.view.colors.color_background.as_deref(), DEFAULT_BACKGROUND);
        let (screen, cells) = egui::CentralPanel::default()
            .frame(egui::Frame::none().fill(background))
            .show(ctx, |ui| self.draw(ui))
            .inner;

        // 3. 尺寸变化时上报单元格位置
        self.report_layout(screen, &cells);
    }
}
