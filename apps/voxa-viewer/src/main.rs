//! Voxa Demo Viewer
//!
//! Clears each swapchain image to a cycling color through the command list,
//! exercising layout transitions and dynamic rendering every frame.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p voxa-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--vsync`: Present with FIFO instead of mailbox/immediate
//! - `--fps <N>`: Frame rate cap (default: 240, 0 for unlimited)
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use voxa_app::{run_app, AppConfig};

use crate::app::Viewer;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const TARGET_FPS: u32 = 240;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Check for help flag before starting the app
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let config = parse_args(&args)?;
    run_app::<Viewer>(config)
}

fn parse_args(args: &[String]) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::new("Voxa Viewer")
        .with_size(WIDTH, HEIGHT)
        .with_target_fps(TARGET_FPS);

    let mut args = args.iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--vsync" => config = config.with_vsync(true),
            "--fps" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--fps needs a value"))?;
                config = config.with_target_fps(value.parse()?);
            }
            other => anyhow::bail!("Unknown argument: {other} (see --help)"),
        }
    }
    Ok(config)
}

fn print_help() {
    eprintln!(
        "Voxa Demo Viewer

USAGE:
    cargo run -p voxa-viewer -- [OPTIONS]

OPTIONS:
    --vsync                 Present with vsync
    --fps <N>               Frame rate cap (default: {TARGET_FPS}, 0 for unlimited)
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn defaults_without_arguments() {
        let config = parse_args(&[]).unwrap();
        assert!(!config.vsync);
        assert_eq!(config.target_fps, Some(TARGET_FPS));
        assert_eq!((config.width, config.height), (WIDTH, HEIGHT));
    }

    #[test]
    fn parses_vsync_and_fps() {
        let config = parse_args(&args(&["--vsync", "--fps", "0"])).unwrap();
        assert!(config.vsync);
        assert_eq!(config.target_fps, None);
    }

    #[test]
    fn rejects_unknown_and_incomplete_arguments() {
        assert!(parse_args(&args(&["--bogus"])).is_err());
        assert!(parse_args(&args(&["--fps"])).is_err());
        assert!(parse_args(&args(&["--fps", "fast"])).is_err());
    }
}
