use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use scribbler_link::config::LinkConfig;
use scribbler_link::runtime::Repeater;
use scribbler_link::scribbler::{
    CancelToken, Connector, Query, Result, Scribbler, Setting, list_ports,
};

#[derive(Parser)]
#[command(name = "scribbler")]
#[command(about = "Talk to a Scribbler robot over its serial link", long_about = None)]
struct Cli {
    /// Port ("COM5", "5", "/dev/ttyUSB0") or robot name to search for
    #[arg(long, short, env = "SCRIBBLER_PORT", global = true)]
    port: Option<String>,

    /// JSON link configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Skip the startup chirp
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the negotiated profile, name and calibration
    Info,

    /// Read all sensors once
    Sensors {
        /// Report the snapshot cached from the last reply instead of polling
        #[arg(long)]
        last: bool,
    },

    /// Stop the motors
    Stop,

    /// Drive for a while, then stop
    Drive {
        #[arg(allow_hyphen_values = true)]
        translate: f32,
        #[arg(allow_hyphen_values = true, default_value = "0")]
        rotate: f32,
        #[arg(long, default_value = "1.0")]
        seconds: f64,
    },

    /// Play a tone (two if --freq2 is given)
    Beep {
        #[arg(long, default_value = "440")]
        freq: u16,
        #[arg(long)]
        freq2: Option<u16>,
        #[arg(long, default_value = "500")]
        millis: u64,
    },

    /// Show the robot's name, or rename it
    Name { new_name: Option<String> },

    /// Show the fudge factors, or save four new ones
    Fudge {
        #[arg(num_args = 4)]
        factors: Option<Vec<f32>>,
    },

    /// Scan COM1..COM20 for a robot announcing itself
    Search {
        name: Option<String>,
        /// Only list serial ports present on this machine
        #[arg(long)]
        list: bool,
    },

    /// Poll sensors periodically and print one JSON line per reading
    Watch {
        #[arg(long, default_value = "500")]
        period_ms: u64,
        #[arg(long, default_value = "10")]
        seconds: u64,
    },

    /// Symbolic query, e.g. `get light center`
    Get {
        subject: String,
        position: Option<String>,
    },

    /// Symbolic setting, e.g. `set led front on`
    Set {
        subject: String,
        position: String,
        value: Option<String>,
    },
}

fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("scribbler: {}", e);
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<LinkConfig> {
    let mut config = match &cli.config {
        Some(path) => LinkConfig::from_json_file(path)?,
        None => LinkConfig::default(),
    };
    if let Some(port) = &cli.port {
        config.target = Some(port.clone());
    }
    let chirp = config.startup_chirp && !cli.quiet;
    Ok(config.startup_chirp(chirp))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    if let Commands::Search { name, list } = &cli.command {
        if *list {
            return print_json(&list_ports()?);
        }
        let mut connector = Connector::system(config, CancelToken::new());
        let mut link = connector.search(name.as_deref())?;
        print_json(&link.path())?;
        link.close();
        return Ok(());
    }

    // --port already folds in SCRIBBLER_PORT, so connect without a second override
    let mut connector = Connector::system(config, CancelToken::new());
    let robot = Scribbler::connect_with(&mut connector)?;
    match cli.command {
        Commands::Info => print_json(&robot.summary()?),
        Commands::Sensors { last } => {
            if last {
                print_json(&robot.last_sensors())
            } else {
                print_json(&robot.sensors()?)
            }
        }
        Commands::Stop => robot.stop(),
        Commands::Drive {
            translate,
            rotate,
            seconds,
        } => {
            let wheels = robot.drive(translate, rotate)?;
            tracing::info!("Driving at left={} right={}", wheels.left, wheels.right);
            robot.pause(Duration::from_secs_f64(seconds.max(0.0)))?;
            robot.stop()
        }
        Commands::Beep {
            freq,
            freq2,
            millis,
        } => robot.beep(Duration::from_millis(millis), freq, freq2),
        Commands::Name { new_name } => {
            if let Some(name) = new_name {
                robot.set(&Setting::Name(name))?;
            }
            print_json(&robot.name()?)
        }
        Commands::Fudge { factors } => {
            if let Some(values) = factors {
                let mut next = robot.fudge();
                for (slot, value) in next.iter_mut().zip(values) {
                    *slot = value;
                }
                let writes = robot.set_fudge(next)?;
                tracing::info!("{} fudge write(s)", writes);
            }
            print_json(&robot.fudge())
        }
        Commands::Watch { period_ms, seconds } => {
            let robot = Arc::new(robot);
            let polled = Arc::clone(&robot);
            let repeater = Repeater::spawn("watch", Duration::from_millis(period_ms), move || {
                let snapshot = polled.sensors()?;
                println!("{}", serde_json::to_string(&snapshot)?);
                Ok(())
            })?;
            thread::sleep(Duration::from_secs(seconds));
            let exit = repeater.stop();
            tracing::debug!("Watch ended: {:?}", exit);
            Ok(())
        }
        Commands::Get { subject, position } => {
            let query = Query::parse(&subject, position.as_deref())?;
            print_json(&robot.get(query)?)
        }
        Commands::Set {
            subject,
            position,
            value,
        } => robot.set(&Setting::parse(&subject, &position, value.as_deref())?),
        Commands::Search { .. } => Ok(()),
    }
}
