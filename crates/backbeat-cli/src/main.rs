//! backbeat: headless drum pattern player

mod config;
mod session;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use backbeat_services::{AudioOutput, NoWakeLock, PlaybackEngine};
use session::Session;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("backbeat=debug".parse()?)
            .add_directive("cpal=warn".parse()?))
        .init();

    let mut args = std::env::args().skip(1);
    let pattern_path = args.next().map(PathBuf::from);

    let app_config = config::load_config();
    let play_seconds = match args.next() {
        Some(secs) => secs.parse().with_context(|| format!("invalid duration {:?}", secs))?,
        None => app_config.player.play_seconds,
    };

    let session = match &pattern_path {
        Some(path) => Session::load(path)?,
        None => Session::builtin()?,
    };

    tracing::info!(
        pattern = %session.current.name,
        bpm = session.current.bpm,
        bars = session.current.bars,
        time_signature = %session.current.time_signature,
        "Starting backbeat"
    );

    let output = AudioOutput::open().context("opening audio output")?;

    let mut engine = PlaybackEngine::new(
        output.clock(),
        Box::new(output.kit()),
        Box::new(output.bgm_player()),
        Box::new(NoWakeLock),
        session.current,
        &app_config.engine,
    )?;

    engine.on_pattern_change(|name| {
        let name = if name.is_empty() { "(draft)" } else { name };
        tracing::info!(pattern = name, "Now playing");
    });
    engine.on_subdivision_change(|subdivision| {
        tracing::trace!(subdivision, "Playhead");
    });

    engine.set_saved_patterns(session.saved)?;
    engine.set_draft_mode(session.is_draft);
    engine.set_loop(session.loop_range);

    engine.set_playing(true)?;
    std::thread::sleep(Duration::from_secs(play_seconds));
    engine.set_playing(false)?;

    output.stop();
    tracing::info!("Done");
    Ok(())
}
