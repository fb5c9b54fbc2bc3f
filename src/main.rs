//! Command line front end for a calibration session directory.
//!
//! Usage:
//! ```bash
//! ground-calib init --config setup.yaml --output sessions
//! ground-calib --session sessions/left_right_minimap add --view 0 --x 120 --y 340
//! ground-calib --session sessions/left_right_minimap calibrate-pair 0 1
//! ground-calib --session sessions/left_right_minimap evaluate 1
//! ```
//!
//! Every command loads `session.yaml`, the point record and the parameter
//! files, applies one operation and saves the session again.

use clap::{Parser, Subcommand};
use ground_calib::calibration::SolveRequest;
use ground_calib::correspondence::Label;
use ground_calib::view::View;
use ground_calib::{Session, SessionConfig};
use log::info;
use nalgebra::Vector2;
use std::path::PathBuf;

/// Multi-view ground calibration tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Session directory containing session.yaml
    #[arg(short = 's', long)]
    session: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a session folder named after its images
    Init {
        /// Session config; image paths are relative to the output directory
        #[arg(long)]
        config: PathBuf,
        /// Directory the session folder is created in
        #[arg(long, default_value = ".")]
        output: PathBuf,
    },
    /// Add a point under a fresh label
    Add {
        #[arg(long)]
        view: View,
        #[arg(long, allow_hyphen_values = true)]
        x: f64,
        #[arg(long, allow_hyphen_values = true)]
        y: f64,
    },
    /// Set the coordinate of a label in a view
    Set {
        #[arg(long)]
        view: View,
        #[arg(long)]
        label: Label,
        #[arg(long, allow_hyphen_values = true)]
        x: f64,
        #[arg(long, allow_hyphen_values = true)]
        y: f64,
    },
    /// Delete a label from one view
    Delete {
        #[arg(long)]
        view: View,
        #[arg(long)]
        label: Label,
    },
    /// Delete a label from every view
    DeleteEverywhere { label: Label },
    /// Toggle the floor mark of a label
    Floor { label: Label },
    /// List all points
    List,
    /// Calibrate two cameras from their shared points
    CalibratePair { view_a: View, view_b: View },
    /// Jointly refine every calibrated camera
    CalibrateJoint,
    /// Add one camera to the calibrated set
    CalibrateOne { target: View },
    /// Forget the calibration of a camera
    Clear { view: View },
    /// Show the ground preview and map error of a calibrated camera
    Evaluate { view: View },
    /// Write all points to a CSV file
    ExportCsv { output: PathBuf },
}

fn check_point(session: &Session, view: View, x: f64, y: f64) -> Result<(), String> {
    let info = session
        .layout()
        .get(view)
        .ok_or_else(|| format!("view {view} is not part of the session"))?;
    if !info.shape.contains(x, y) {
        return Err(format!("({x}, {y}) lies outside {}", info.name));
    }
    Ok(())
}

fn list(session: &Session) {
    let store = session.store();
    for (view, points) in store.point_data() {
        let name = session
            .layout()
            .get(*view)
            .map(|info| info.name.as_str())
            .unwrap_or("?");
        println!("view {view} ({name}):");
        for (label, point) in points {
            let floor = if store.is_floor(*label) { " floor" } else { "" };
            println!("  {label}: ({:.2}, {:.2}){floor}", point.x, point.y);
        }
    }
    println!(
        "calibrated views: {:?}",
        session.orchestrator().calibrated()
    );
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    if let Command::Init { config, output } = &cli.command {
        let session = Session::create_in(output, SessionConfig::load_from_yaml(config)?)?;
        println!("Created session {}", session.dir().display());
        return Ok(());
    }

    let dir = cli
        .session
        .ok_or("--session is required for this command")?;
    let mut session = Session::open(&dir)?;
    info!(
        "Opened session {} with {} cameras",
        session.dir().display(),
        session.layout().view_count()
    );

    let mut modified = true;
    match cli.command {
        Command::Init { .. } => modified = false,
        Command::Add { view, x, y } => {
            check_point(&session, view, x, y)?;
            let label = session.store_mut().add_point(view, Vector2::new(x, y));
            println!("Added label {label} in view {view}");
        }
        Command::Set { view, label, x, y } => {
            check_point(&session, view, x, y)?;
            session.store_mut().set_point(view, label, Vector2::new(x, y));
        }
        Command::Delete { view, label } => {
            if !session.store_mut().delete_in_view(view, label) {
                println!("Label {label} is not in view {view}");
                modified = false;
            }
        }
        Command::DeleteEverywhere { label } => {
            if !session.store_mut().delete_everywhere(label) {
                println!("Label {label} does not exist");
                modified = false;
            }
        }
        Command::Floor { label } => match session.store_mut().toggle_floor(label) {
            Some(on_floor) => println!("Label {label} floor: {on_floor}"),
            None => {
                println!("Label {label} does not exist");
                modified = false;
            }
        },
        Command::List => {
            list(&session);
            modified = false;
        }
        Command::CalibratePair { view_a, view_b } => {
            let updated = session.calibrate(SolveRequest::Pair { view_a, view_b })?;
            println!("Calibrated views {updated:?}");
        }
        Command::CalibrateJoint => {
            let updated = session.calibrate(SolveRequest::Joint)?;
            println!("Refined views {updated:?}");
        }
        Command::CalibrateOne { target } => {
            let updated = session.calibrate(SolveRequest::One { target })?;
            println!("Calibrated views {updated:?}");
        }
        Command::Clear { view } => {
            modified = session.orchestrator_mut().clear(view);
            println!("View {view} cleared: {modified}");
        }
        Command::Evaluate { view } => {
            let evaluation = session.evaluate(view)?;
            for (camera, map) in &evaluation.preview {
                println!(
                    "({:.1}, {:.1}) -> ({:.1}, {:.1})",
                    camera.x, camera.y, map.x, map.y
                );
            }
            match &evaluation.error {
                Some(error) => println!("{error:?}"),
                None => println!("No points of view {view} are marked on the map"),
            }
            modified = false;
        }
        Command::ExportCsv { output } => {
            let rows = session.export_csv(&output)?;
            println!("Exported {rows} points to {}", output.display());
            modified = false;
        }
    }

    if modified {
        session.save()?;
    }
    Ok(())
}
