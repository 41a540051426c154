use anyhow::Result;

use crate::config::LoggingConfig;

fn parse_level(level: &str) -> log::LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

/// Wires the process-wide logger: timestamped lines to stdout, plus a log
/// file when a directory is configured. `--debug` overrides the configured
/// level.
pub fn setup_logging(config: &LoggingConfig, force_debug: bool) -> Result<()> {
    let level = if force_debug {
        log::LevelFilter::Debug
    } else {
        parse_level(&config.level)
    };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout());

    if let Some(dir) = &config.dir {
        std::fs::create_dir_all(dir)?;
        let filename = config.file.clone().unwrap_or_else(|| {
            format!("rustcon_{}.log", chrono::Local::now().format("%Y-%m-%d"))
        });
        dispatch = dispatch.chain(fern::log_file(dir.join(filename))?);
    }

    dispatch.apply()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_with_info_fallback() {
        assert_eq!(parse_level("debug"), log::LevelFilter::Debug);
        assert_eq!(parse_level("WARN"), log::LevelFilter::Warn);
        assert_eq!(parse_level("warning"), log::LevelFilter::Warn);
        assert_eq!(parse_level("error"), log::LevelFilter::Error);
        assert_eq!(parse_level("nonsense"), log::LevelFilter::Info);
    }
}
