//! Runs the refresh pipeline against a simulated display engine on the host.
//!
//! Use `RUST_LOG=debug` (or `trace`) to follow each pipeline through the manager.

#[path = "sim/hw.rs"]
mod hw;

use eink_refresh::buffer::GrayBuffer;
use eink_refresh::config::EinkConfig;
use eink_refresh::{EinkManager, EinkUpdate, UpdateMode};
use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Ticker, Timer};
use embedded_graphics::mono_font::ascii::FONT_10X20;
use embedded_graphics::mono_font::MonoTextStyle;
use embedded_graphics::pixelcolor::{Gray8, GrayColor};
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{Circle, PrimitiveStyle, Rectangle};
use embedded_graphics::text::{Alignment, Text};
use hw::{SimHw, SimRegistry, FRAME_PERIOD_US, LINES};
use log::{error, info};
use static_cell::StaticCell;

type SimManager = EinkManager<CriticalSectionRawMutex, SimHw, SimRegistry, 8, 8>;

static MANAGER: StaticCell<SimManager> = StaticCell::new();

#[embassy_executor::task]
async fn manager_task(manager: &'static SimManager) {
    manager.run().await;
}

/// Raises the engine interrupt and the end-of-frame notification.
#[embassy_executor::task]
async fn engine_task(manager: &'static SimManager) {
    const TICKS_PER_FRAME: u64 = 4;
    let mut ticker = Ticker::every(Duration::from_micros(FRAME_PERIOD_US / TICKS_PER_FRAME));
    let mut tick: u64 = 0;
    loop {
        ticker.next().await;
        tick += 1;
        if LINES.irq_pending() {
            manager.on_irq();
        }
        if LINES.scanning() && tick % TICKS_PER_FRAME == 0 {
            manager.on_frame_displayed();
        }
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_micros()
        .init();

    let config = EinkConfig::new(200, 120);
    let manager = match EinkManager::new(config.clone(), SimHw::new(&config), SimRegistry::new(4))
    {
        Ok(manager) => MANAGER.init(manager),
        Err(e) => {
            error!("Failed to create the manager: {}", e);
            return;
        }
    };
    let manager: &'static SimManager = manager;
    spawner.must_spawn(manager_task(manager));
    spawner.must_spawn(engine_task(manager));

    let mut buffer = match GrayBuffer::for_panel(&config) {
        Ok(buffer) => buffer,
        Err(e) => {
            error!("Failed to allocate the frame buffer: {}", e);
            return;
        }
    };

    info!("Clearing the panel");
    show(manager, &buffer, UpdateMode::Init, Rectangle::zero()).await;

    info!("Drawing some text");
    let text_style = MonoTextStyle::new(&FONT_10X20, Gray8::BLACK);
    let _ = Text::with_alignment(
        "eink-refresh",
        buffer.bounding_box().center(),
        text_style,
        Alignment::Center,
    )
    .draw(&mut buffer);
    show(manager, &buffer, UpdateMode::Global, Rectangle::zero()).await;

    info!("Drawing two disjoint partial updates");
    let left = Rectangle::new(Point::new(10, 10), Size::new(30, 30));
    let right = Rectangle::new(Point::new(160, 80), Size::new(30, 30));
    let _ = Circle::new(left.top_left, left.size.width)
        .into_styled(PrimitiveStyle::with_fill(Gray8::new(0x40)))
        .draw(&mut buffer);
    show(manager, &buffer, UpdateMode::Rect, Rectangle::zero()).await;
    let _ = right
        .into_styled(PrimitiveStyle::with_fill(Gray8::new(0x80)))
        .draw(&mut buffer);
    show(manager, &buffer, UpdateMode::Rect, right).await;

    info!("Cold panel refresh");
    manager.set_temperature(5);
    let _ = buffer.clear(Gray8::WHITE);
    show(manager, &buffer, UpdateMode::Global, Rectangle::zero()).await;

    // Let the last pipelines run out.
    Timer::after_millis(500).await;
    if let Err(e) = manager.disable() {
        error!("Failed to disable the manager: {}", e);
    }
    info!("Done: {:?}", manager.stats());
    std::process::exit(0);
}

async fn show(manager: &SimManager, buffer: &GrayBuffer, mode: UpdateMode, area: Rectangle) {
    match manager.update_image(Some(buffer.data()), mode, area).await {
        Ok(admission) => info!("Image {:?}", admission),
        Err(e) => error!("Update rejected: {}", e),
    }
    Timer::after_millis(100).await;
}
