use std::env;
use std::process;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use hass_hvac::{Config, Controller, Result};

fn usage() -> ! {
    eprintln!("usage: hass-hvac <run|check> <config.yaml>");
    eprintln!();
    eprintln!("  run    start the controller; while running, `status` and");
    eprintln!("         `trigger` lines on stdin query state and force an evaluation");
    eprintln!("  check  validate the configuration file and exit");
    process::exit(2);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let (command, config_path) = match (args.get(1), args.get(2)) {
        (Some(command), Some(path)) => (command.as_str(), path.as_str()),
        _ => usage(),
    };

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = config_path, error = %e, "configuration rejected");
            process::exit(1);
        }
    };

    match command {
        "check" => {
            println!("config_ok={config_path}");
        }
        "run" => {
            if let Err(e) = run(config).await {
                error!(error = %e, "controller failed");
                process::exit(1);
            }
        }
        _ => usage(),
    }
}

async fn run(config: Config) -> Result<()> {
    let mut controller = Controller::start(config).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            fatal = controller.run() => {
                // The protocol client only ends on a fatal failure.
                return fatal;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return controller.shutdown().await;
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match line.trim() {
                    "status" => {
                        let status = controller.status().await;
                        println!("state={}", status.state);
                        println!("connected={}", status.connected);
                        println!("entities={}", status.entity_count);
                        println!("temp_sensor={}", status.temp_sensor);
                    }
                    "trigger" => {
                        controller.trigger_evaluation().await?;
                        println!("triggered=true");
                    }
                    "" => {}
                    other => eprintln!("unknown command: {other}"),
                },
                // stdin closed (e.g. running under a supervisor): keep serving.
                Ok(None) | Err(_) => stdin_open = false,
            },
        }
    }
}
