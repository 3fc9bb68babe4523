use anyhow::Result;
use clap::{Parser, Subcommand};

use outset::app::OutsetApp;
use outset::config::Settings;
use outset::logging;
use outset::pass::PassReport;

#[derive(Parser, Debug)]
#[command(name = "outset")]
#[command(version)]
#[command(about = "Run scripts and packages at boot, login and on demand", long_about = None)]
struct Cli {
    /// Enable debug logging and honour unmanaged script payloads.
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run boot-once and boot-every items (launch daemon context).
    Boot,
    /// Run login-once and login-every items for the console user.
    Login,
    /// Run privileged login items (launch daemon context).
    LoginPrivileged,
    /// Run login-window items.
    LoginWindow,
    /// Manually run login-every items.
    LoginEvery,
    /// Manually run login-once items.
    LoginOnce,
    /// Run on-demand items as the console user.
    OnDemand,
    /// Run privileged on-demand items.
    OnDemandPrivileged,
    /// Clear on-demand directories and triggers.
    Cleanup,
    /// Add users to the ignored list.
    AddIgnoredUser {
        #[arg(required = true)]
        users: Vec<String>,
    },
    /// Remove users from the ignored list.
    RemoveIgnoredUser {
        #[arg(required = true)]
        users: Vec<String>,
    },
    /// Force login-once items to run again (`payload=<name>` for payload scripts).
    AddOverride {
        #[arg(required = true)]
        items: Vec<String>,
    },
    /// Remove login-once overrides.
    RemoveOverride {
        #[arg(required = true)]
        items: Vec<String>,
    },
    /// Print SHA-256 of the given files, or of every file under the root with `all`.
    ComputeSha {
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Log the approved checksum list.
    ChecksumReport,
    /// Validate runtime configuration.
    Doctor,
    /// Show identity, pending work, triggers and the last run report as JSON.
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load()?;
    let rotate = matches!(cli.command, Some(Commands::Boot));
    logging::init(&settings, cli.debug || settings.debug, rotate);

    let command = cli.command.unwrap_or(Commands::Doctor);
    if let Commands::Doctor = command {
        print_doctor(&settings);
        return Ok(());
    }

    let mut app = OutsetApp::new(settings, cli.debug)?;
    match command {
        Commands::Boot => {
            let report = app.run_boot()?;
            if !report.network_ready {
                println!("boot-once skipped: network unavailable");
            }
            print_passes(report.boot_once.iter().chain(report.boot_every.iter()));
        }
        Commands::Login => print_passes(&app.run_login()?),
        Commands::LoginPrivileged => print_passes(&app.run_login_privileged()?),
        Commands::LoginWindow => print_passes([app.run_login_window()?].iter()),
        Commands::LoginEvery => print_passes(app.run_login_every()?.iter()),
        Commands::LoginOnce => print_passes(app.run_login_once()?.iter()),
        Commands::OnDemand => print_passes(app.run_on_demand()?.iter()),
        Commands::OnDemandPrivileged => print_passes(app.run_on_demand_privileged()?.iter()),
        Commands::Cleanup => {
            let removed = app.run_cleanup()?;
            println!("cleanup removed {removed} item(s)");
        }
        Commands::AddIgnoredUser { users } => app.add_ignored_users(&users)?,
        Commands::RemoveIgnoredUser { users } => app.remove_ignored_users(&users)?,
        Commands::AddOverride { items } => app.add_overrides(&items)?,
        Commands::RemoveOverride { items } => app.remove_overrides(&items)?,
        Commands::ComputeSha { files } => {
            for line in app.compute_sha_lines(&files)? {
                println!("{line}");
            }
        }
        Commands::ChecksumReport => {
            app.checksum_report();
        }
        Commands::Status => println!("{}", app.status_json()?),
        Commands::Doctor => print_doctor(app.settings()),
    }

    Ok(())
}

fn print_passes<'a>(reports: impl IntoIterator<Item = &'a PassReport>) {
    for report in reports {
        println!(
            "{}: source={} executed={} succeeded={} failed={} skipped={} rejected={}",
            report.phase,
            report.source.as_str(),
            report.executed(),
            report.succeeded(),
            report.failed(),
            report.skipped(),
            report.rejected()
        );
    }
}

fn print_doctor(settings: &Settings) {
    let report = settings.doctor_report();
    println!("Outset Doctor");
    println!("root: {}", report.root.display());
    println!("log_file: {}", report.log_file.display());
    println!("trigger_dir: {}", report.trigger_dir.display());
    println!("machine_prefs_file: {}", report.machine_prefs_file.display());
    println!("managed_prefs_file: {}", report.managed_prefs_file.display());
    println!("user_prefs_file: {}", report.user_prefs_file.display());
    println!("report_file: {}", report.report_file.display());
    println!("debug: {}", report.debug);
    println!(
        "console_user_override: {}",
        report
            .console_user_override
            .unwrap_or_else(|| "<unset>".to_string())
    );
    println!("required_owner_uid: {}", report.required_owner_uid);
    println!("shell: {}", report.shell);
    println!("network_probe_addr: {}", report.network_probe_addr);
    if report.warnings.is_empty() {
        println!("status: ok");
    } else {
        println!("status: warning");
        for warning in report.warnings {
            println!("- {}", warning);
        }
    }
}
