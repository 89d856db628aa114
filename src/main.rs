// src/main.rs
mod channel;
mod clock;
mod config;
mod cycle;
mod engine;
mod gui;
mod protocol;
mod surface;
mod types;
use anyhow::{anyhow, Context, Result};
use channel::{FramedChannel, Outbound};
use clock::{Clock, SystemClock};
use clap::Parser;
use config::ClientConfig;
use eframe::egui;
use engine::Engine;
use log::info;
use std::sync::mpsc;
use std::sync::Arc;
use surface::{ChannelSurface, LogSurface};
// 入口函数
fn main() -> Result<()> {
    env_logger::init();
    let config = ClientConfig::parse();
    info!("connecting to controller at {}:{}", config.host, config.port);

    // 1. 连接控制端并启动接收线程
    let framed = Arc::new(
        FramedChannel::connect(&config.host, config.port)
            .with_context(|| format!("cannot connect to {}:{}", config.host, config.port))?,
    );
    info!("connected to {}", framed.peer());
    let (tx_inbound, rx_inbound) = mpsc::channel();
    framed
        .spawn_receiver(tx_inbound)
        .context("failed to start the receive thread")?;
    let outbound: Arc<dyn Outbound> = framed.clone();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // 2. 无窗口模式：日志代替画面
    if config.headless {
        let engine = Engine::new(rx_inbound, outbound, Box::new(LogSurface::default()), clock);
        let handle = engine::spawn_thread(engine).context("failed to start the engine thread")?;
        handle.join().map_err(|_| anyhow!("engine thread panicked"))?;
        return Ok(());
    }

    // 3. 窗口模式
    let (tx_surface, rx_surface) = mpsc::sync_channel(surface::SURFACE_QUEUE);
    let engine = Engine::new(
        rx_inbound,
        outbound.clone(),
        Box::new(ChannelSurface::new(tx_surface)),
        clock.clone(),
    );
    engine::spawn_thread(engine).context("failed to start the engine thread")?;
    let app = gui::SpellerApp::new(rx_surface, outbound, clock);

    let viewport = egui::ViewportBuilder::default()
        .with_inner_size([1365.0, 768.0])
        .with_min_inner_size([450.0, 450.0])
        .with_title("c-VEP Speller");
    let options = eframe::NativeOptions {
        viewport,
        ..Default::default()
    };
    eframe::run_native("cvep-speller", options, Box::new(|_cc| Box::new(app)))
        .map_err(|e| anyhow!("window failed: {e}"))?;

    // 窗口被用户关掉时也要断开
    framed.close();
    Ok(())
}
