#![allow(unused_imports)]

use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use clap::{Parser, Subcommand};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::sync::mpsc;

use batch_printer::{
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    conn_manager::{PrinterConnCmd, PrinterConnManager, PrinterConnMsg, PrinterRegistry},
    dispatch::BatchDispatcher,
    logging,
    mapping::PrinterMapping,
    project::ProjectFile,
    session::{BatchPrintSession, COLUMN_NAME, COLUMN_STATUS},
};

#[derive(Debug, Parser)]
#[command(version, about = "Send sliced plates to a fleet of Bambu printers")]
struct Opts {
    /// printer list, defaults to printers.toml when present
    #[arg(short, long, env = "BATCH_PRINTER_CONFIG")]
    config: Option<PathBuf>,

    /// seconds to wait for printers to report in
    #[arg(long, default_value_t = 10)]
    wait: u64,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// List connected printers with their status
    Printers {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        status: Option<String>,
        /// map filaments against a plate of this project
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, requires = "file")]
        plate: Option<u32>,
    },
    /// List the sliced plates of a project file
    Plates {
        #[arg(long)]
        file: PathBuf,
    },
    /// Print one plate on every given printer
    Print {
        #[arg(long)]
        file: PathBuf,
        /// defaults to the first sliced plate
        #[arg(long)]
        plate: Option<u32>,
        #[arg(long = "printer", required = true)]
        printers: Vec<String>,
        #[arg(long)]
        no_timelapse: bool,
        #[arg(long)]
        no_bed_levelling: bool,
        #[arg(long)]
        no_flow_calibration: bool,
        #[arg(long)]
        no_vibration_calibration: bool,
        #[arg(long, env = "USER", default_value = "cli")]
        operator: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let opts = Opts::parse();
    let _guard = logging::init_logs()?;

    if let Cmd::Plates { file } = &opts.cmd {
        return show_plates(file).await;
    }

    let config = load_config(opts.config.as_deref())?;
    ensure!(!config.is_empty(), "no printers configured");

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<PrinterConnCmd>();
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<PrinterConnMsg>();

    let mut conn = PrinterConnManager::new(config.clone(), cmd_tx, cmd_rx, msg_tx);
    conn.init().await?;
    let registry = conn.registry();

    debug!("starting conn manager");
    tokio::spawn(async move {
        if let Err(e) = conn.run().await {
            error!("error in conn manager: {:?}", e);
        }
    });

    wait_for_printers(&registry, &mut msg_rx, Duration::from_secs(opts.wait)).await;

    let mut session =
        BatchPrintSession::from_config(registry.clone(), BatchDispatcher::current(), &config);
    session.configure();

    match opts.cmd {
        Cmd::Plates { .. } => unreachable!(),
        Cmd::Printers {
            name,
            status,
            file,
            plate,
        } => {
            if let Some(file) = file {
                let (filename, data) = read_project(&file).await?;
                session.load_project_file(&filename, data)?;
                if let Some(plate) = plate {
                    session.select_plate(plate)?;
                }
            }
            if let Some(name) = name {
                session.set_filter(COLUMN_NAME, &name)?;
            }
            if let Some(status) = status {
                session.set_filter(COLUMN_STATUS, &status)?;
            }
            print_rows(&session.visible_rows());
            let offline = registry.len() - session.mappings().len();
            if offline > 0 {
                println!("{} printer(s) offline", offline);
            }
        }
        Cmd::Print {
            file,
            plate,
            printers,
            no_timelapse,
            no_bed_levelling,
            no_flow_calibration,
            no_vibration_calibration,
            operator,
        } => {
            let (filename, data) = read_project(&file).await?;
            session.load_project_file(&filename, data)?;
            if let Some(plate) = plate {
                session.select_plate(plate)?;
            }

            let options = session.options_mut();
            options.timelapse = !no_timelapse;
            options.bed_levelling = !no_bed_levelling;
            options.flow_calibration = !no_flow_calibration;
            options.vibration_calibration = !no_vibration_calibration;

            for name in printers.iter() {
                let detail = registry
                    .find_by_name(name)
                    .with_context(|| format!("unknown printer: {}", name))?;
                if !session.select(&detail.id) {
                    bail!("printer is offline: {}", name);
                }
            }

            let report = session.print_selected(&operator)?;
            println!("queued {} print(s)", report.queued);

            let names: Vec<String> = session
                .selected()
                .iter()
                .map(|m| m.name().to_string())
                .collect();
            let results = futures::future::join_all(report.handles).await;

            let mut failed = 0;
            for (name, res) in names.iter().zip(results) {
                match res {
                    Ok(Ok(())) => println!("{:<24} sent", name),
                    Ok(Err(e)) => {
                        failed += 1;
                        println!("{:<24} failed: {:#}", name, e);
                    }
                    Err(e) => {
                        failed += 1;
                        println!("{:<24} task error: {}", name, e);
                    }
                }
            }
            ensure!(failed == 0, "{} of {} prints failed", failed, names.len());
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_from_file(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            AppConfig::load_from_file(DEFAULT_CONFIG_PATH)?
        }
        None => AppConfig::empty(),
    };
    if let Some(id) = config.add_printer_from_env()? {
        debug!("added printer {} from environment", id);
    }
    Ok(config)
}

/// Returns once every printer has sent a full report or `timeout` passed
async fn wait_for_printers(
    registry: &PrinterRegistry,
    msg_rx: &mut mpsc::UnboundedReceiver<PrinterConnMsg>,
    timeout: Duration,
) {
    let all_reported = || {
        registry
            .printers_detail()
            .iter()
            .all(|d| d.is_running() && d.state.filaments_reported)
    };
    let deadline = tokio::time::Instant::now() + timeout;
    while !all_reported() {
        match tokio::time::timeout_at(deadline, msg_rx.recv()).await {
            Ok(Some(msg)) => trace!("printer message: {:?}", msg),
            Ok(None) => break,
            Err(_) => {
                warn!("not every printer reported within {:?}", timeout);
                break;
            }
        }
    }
}

async fn read_project(path: &Path) -> Result<(String, Vec<u8>)> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("invalid file name: {}", path.display()))?
        .to_string();
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok((filename, data))
}

async fn show_plates(path: &Path) -> Result<()> {
    let (filename, data) = read_project(path).await?;
    let project = ProjectFile::setup(&filename, data)?;
    if project.plates().is_empty() {
        println!("No sliced plates found");
        return Ok(());
    }
    for plate in project.plates() {
        let filaments: Vec<String> = plate
            .filaments
            .iter()
            .map(|f| format!("{} #{} {:.1}g", f.filament_type, f.color, f.used_g))
            .collect();
        println!(
            "{:>3}  {:<24} {:>9} {:>8.1}g  {}",
            plate.index,
            plate.name,
            plate.prediction_text(),
            plate.weight,
            filaments.join(", ")
        );
    }
    Ok(())
}

fn print_rows(rows: &[&PrinterMapping]) {
    println!(
        "{:<24} {:<12} {:<14} {:<5} {:<20} {}",
        "Name", "Status", "Progress", "Ready", "Bulk Status", "Filament Mapping"
    );
    for m in rows {
        let progress = m
            .detail()
            .map(|d| d.state.progress_text())
            .unwrap_or_default();
        println!(
            "{:<24} {:<12} {:<14} {:<5} {:<20} {}",
            m.name(),
            m.status_text(),
            progress,
            if m.is_ready() { "yes" } else { "no" },
            m.bulk_status().text(),
            m.filament_status_text()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_flags_parse() {
        let opts = Opts::try_parse_from([
            "batch_printer",
            "print",
            "--file",
            "a.3mf",
            "--printer",
            "X1C",
            "--printer",
            "P1S",
            "--no-timelapse",
            "--operator",
            "alice",
        ])
        .unwrap();
        match opts.cmd {
            Cmd::Print {
                printers,
                no_timelapse,
                no_bed_levelling,
                plate,
                operator,
                ..
            } => {
                assert_eq!(printers, vec!["X1C", "P1S"]);
                assert!(no_timelapse);
                assert!(!no_bed_levelling);
                assert_eq!(plate, None);
                assert_eq!(operator, "alice");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn printers_plate_needs_a_file() {
        assert!(Opts::try_parse_from(["batch_printer", "printers", "--plate", "2"]).is_err());
        let opts = Opts::try_parse_from([
            "batch_printer",
            "printers",
            "--file",
            "a.3mf",
            "--plate",
            "2",
        ])
        .unwrap();
        assert!(matches!(
            opts.cmd,
            Cmd::Printers { plate: Some(2), file: Some(_), .. }
        ));
    }

    #[test]
    fn print_needs_a_printer() {
        assert!(Opts::try_parse_from(["batch_printer", "print", "--file", "a.3mf"]).is_err());
    }
}
