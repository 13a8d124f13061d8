//! sigul-pki - provision and audit the Sigul certificate authority.
//!
//! Exit codes: 0 success, 1 failure, 2 configuration error, 75 authority
//! not ready (retry later), 78 security invariant violation.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sigul_pki::store::CredentialStore;
use sigul_pki::{
    audit_stores, deploy, exit, open_store, run_authority, run_principal, Deployment,
    DeploymentConfig, DeploymentPlan, Expectation, InvariantValidator, Mode, ProvisionError,
    ProvisionOutcome, Severity, Step,
};
use sigul_pki::{AuthorityCertificate, ErrorKind, Principal};

#[derive(Parser)]
#[command(name = "sigul-pki")]
#[command(about = "Certificate lifecycle orchestration for Sigul", long_about = None)]
struct Cli {
    /// Deployment configuration file
    #[arg(short, long, env = "SIGUL_PKI_CONFIG", default_value = "/etc/sigul/pki.toml")]
    config: PathBuf,

    /// Override the configured mode
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Override the credential store root
    #[arg(long)]
    store_root: Option<PathBuf>,

    /// Override the export root
    #[arg(long)]
    export_root: Option<PathBuf>,

    /// Override the secrets root
    #[arg(long)]
    secrets_root: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the authority store and export consumer bundles
    Authority,

    /// Import the exported credentials into a consumer's store
    Principal {
        /// Principal name from the configuration
        name: String,
    },

    /// Check one store against its invariants without changing it
    Verify {
        name: String,
    },

    /// Check every store, including that the authority key exists once
    Audit,

    /// Provision every principal in dependency order, then audit
    Deploy,

    /// List the certificates in a store
    List {
        name: String,
    },
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        1 => tracing_subscriber::EnvFilter::new("debug"),
        _ => tracing_subscriber::EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_deployment(cli: &Cli) -> sigul_pki::Result<Deployment> {
    let mut config = DeploymentConfig::load(&cli.config)?;
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    if let Some(root) = &cli.store_root {
        config.store_root = root.clone();
    }
    if let Some(root) = &cli.export_root {
        config.export_root = root.clone();
    }
    if let Some(root) = &cli.secrets_root {
        config.secrets_root = root.clone();
    }
    config.validate()
}

fn print_outcome(outcome: &ProvisionOutcome) {
    println!("{}: {}", outcome.principal, outcome.state);
    for action in outcome.plan.mutations() {
        println!("  {action}");
    }
    for warning in outcome.report.warnings() {
        println!("  warning: {warning}");
    }
}

async fn verify(deployment: &Deployment, principal: &Principal) -> anyhow::Result<()> {
    let password = deployment.password.resolve()?;
    let store = open_store(deployment, principal, &password, Mode::Skip)?;

    let mut validator = InvariantValidator::new();
    if !principal.is_authority() {
        let path = deployment.layout.authority_certificate_path(&principal.name);
        if let Ok(text) = std::fs::read_to_string(&path) {
            let published = AuthorityCertificate::from_pem(&text).map_err(|e| {
                ProvisionError::new(
                    principal.name.clone(),
                    Step::Verify,
                    ErrorKind::Import(format!("{}: {e}", path.display())),
                )
            })?;
            validator = validator.trusting(published.certificate().clone());
        }
    }

    let expected = Expectation::for_member(principal, &deployment.principals);
    let report = validator.verify(&store, &expected).await.map_err(|e| {
        ProvisionError::new(
            principal.name.clone(),
            Step::Verify,
            ErrorKind::from_store(e, ErrorKind::store_access),
        )
    })?;
    for finding in &report.findings {
        let level = match finding.severity() {
            Severity::Warning => "warning",
            Severity::Violation => "violation",
        };
        println!("{level}: {finding}");
    }
    report.into_result(Step::Verify)?;
    println!("{}: ok", principal.name);
    Ok(())
}

async fn list(deployment: &Deployment, principal: &Principal) -> anyhow::Result<()> {
    let password = deployment.password.resolve()?;
    let store = open_store(deployment, principal, &password, Mode::Skip)?;
    let records = store
        .list_certificates()
        .await
        .with_context(|| format!("listing {}", store.location()))?;

    for record in records {
        println!(
            "{:<20} {:<12} {:<4} {:<32} {}",
            record.nickname.as_str(),
            record.trust_attributes.to_string(),
            if record.has_private_key { "key" } else { "-" },
            record.subject_cn,
            record.not_after.format("%Y-%m-%d"),
        );
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let deployment = load_deployment(&cli)?;
    let mode = deployment.mode;

    match cli.command {
        Commands::Authority => {
            let password = deployment.password.resolve()?;
            let authority = deployment.authority();
            let store = open_store(&deployment, authority, &password, mode)?;
            let run = run_authority(&deployment, &store, &password, mode).await?;
            print_outcome(&run.outcome);
            for name in &run.exported {
                println!("  exported {name}");
            }
        }
        Commands::Principal { name } => {
            let principal = deployment.principal(&name)?;
            if principal.is_authority() {
                anyhow::bail!("{name} is the authority; use `sigul-pki authority`");
            }
            let password = deployment.password.resolve()?;
            let store = open_store(&deployment, principal, &password, mode)?;
            let plan = DeploymentPlan::new(&deployment);
            let outcome = run_principal(&deployment, &plan, principal, &store, mode).await?;
            print_outcome(&outcome);
        }
        Commands::Verify { name } => {
            let principal = deployment.principal(&name)?;
            verify(&deployment, principal).await?;
        }
        Commands::Audit => {
            let password = deployment.password.resolve()?;
            let mut stores = Vec::with_capacity(deployment.principals.len());
            for principal in &deployment.principals {
                stores.push((principal, open_store(&deployment, principal, &password, Mode::Skip)?));
            }
            let handles: Vec<(&Principal, &dyn CredentialStore)> = stores
                .iter()
                .map(|(p, s)| (*p, s as &dyn CredentialStore))
                .collect();
            let report = audit_stores(&deployment, &handles).await?;
            for r in &report.reports {
                println!("{}: ok", r.principal);
            }
            println!("authority key held by: {}", report.authority_key_holders.join(", "));
        }
        Commands::Deploy => {
            let password = deployment.password.resolve()?;
            let report = deploy(&deployment, &password, mode).await?;
            for outcome in &report.outcomes {
                print_outcome(outcome);
            }
            println!("audit: ok");
        }
        Commands::List { name } => {
            let principal = deployment.principal(&name)?;
            list(&deployment, principal).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::from(exit::SUCCESS),
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e
                .chain()
                .find_map(|cause| cause.downcast_ref::<ProvisionError>())
                .map(ProvisionError::exit_code)
                .unwrap_or(exit::FAILURE);
            ExitCode::from(code)
        }
    }
}
