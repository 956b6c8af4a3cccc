use tokio_util::sync::CancellationToken;

mod config;
mod sink;

fn init_logging(level: log::LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .filter_module("codec_bus", level)
        .parse_default_env()
        .init();
}

#[cfg(feature = "ffmpeg")]
fn transcode(input: &str, cancel: CancellationToken) -> anyhow::Result<()> {
    use std::sync::Arc;

    use codec_bus::{
        device::DeviceContext, factory::FfmpegBackends, input::AvInput, packet::CompressedUnit,
        session::Session, source::MediaSource,
    };

    codec_bus::init()?;
    let config = config::config();
    let mut source = AvInput::new(input, config.input_format.as_deref(), None)?;
    let ctx = DeviceContext::new(config.session.backend, config.session.device_id);
    let sink = Arc::new(sink::FileSink::create(&config.out_dir)?);
    let session = Session::open(
        &FfmpegBackends,
        &ctx,
        &config.session,
        source.streams(),
        sink.clone(),
    )?;

    let mut listener = |unit: CompressedUnit| {
        if let Err(e) = session.push(unit) {
            log::debug!("unit refused: {}", e);
        }
    };
    let read = source.run(&mut listener, &cancel);

    session.close();
    sink.flush()?;
    let (video, audio) = sink.written();
    log::info!(
        "transcode finished: {} video bytes, {} audio bytes in {}",
        video,
        audio,
        config.out_dir.display()
    );
    read
}

#[cfg(not(feature = "ffmpeg"))]
fn transcode(input: &str, _cancel: CancellationToken) -> anyhow::Result<()> {
    anyhow::bail!(
        "cannot transcode {}: built without the `ffmpeg` feature",
        input
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::config();
    init_logging(config.log_level());

    let input = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config.input.clone());
    if input.is_empty() {
        anyhow::bail!(
            "no input: pass a path or URL, or set `input` in the file named by {}",
            config::CONFIG_ENV
        );
    }

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let mut job = tokio::task::spawn_blocking(move || transcode(&input, cancel_clone));

    loop {
        tokio::select! {
            res = &mut job => {
                return res?;
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted, draining pipelines");
                cancel.cancel();
            },
        }
    }
}
