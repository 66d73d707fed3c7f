//! Command line entry point for the Order Filler server.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{CommandFactory, Parser, ValueEnum};
use snafu::Report;
use tracing::{error, warn};

use dcmof::config::{parse_endpoint, ServerConfig, TransferSyntaxPreset};
use dcmof::dispatch::{DimseOp, DimseHandler, ServiceRegistry};
use dcmof::mpps::{MppsService, MODALITY_PERFORMED_PROCEDURE_STEP};
use dcmof::notification::{
    NotificationService, BASIC_STUDY_CONTENT_NOTIFICATION, INSTANCE_AVAILABILITY_NOTIFICATION,
};
use dcmof::notify::{status_channel, LogStatusListener};
use dcmof::security::{init_tls, TlsCipherSuite, TlsConfig};
use dcmof::server::OrderFiller;
use dcmof::store::{DicomCodec, JsonCodec, RecordCodec, RecordStore};

/// DICOM Order Filler: accepts MPPS, IAN and SCN objects and stores
/// them as files.
#[derive(Debug, Parser)]
#[command(name = "dcmof", version)]
struct Cli {
    /// Listen endpoint: [<aet>[@<host>]:]<port>
    addr: String,

    /// Store MPPS objects as DICOM files in this directory
    #[arg(long, value_name = "DIR", conflicts_with = "mpps_json")]
    mpps: Option<PathBuf>,

    /// Store MPPS objects as DICOM JSON files in this directory
    #[arg(long, value_name = "DIR")]
    mpps_json: Option<PathBuf>,

    /// Store Instance Availability Notifications as DICOM files
    #[arg(long, value_name = "DIR", conflicts_with = "ian_json")]
    ian: Option<PathBuf>,

    /// Store Instance Availability Notifications as DICOM JSON files
    #[arg(long, value_name = "DIR")]
    ian_json: Option<PathBuf>,

    /// Store Basic Study Content Notifications as DICOM files
    #[arg(long, value_name = "DIR", conflicts_with = "scn_json")]
    scn: Option<PathBuf>,

    /// Store Basic Study Content Notifications as DICOM JSON files
    #[arg(long, value_name = "DIR")]
    scn_json: Option<PathBuf>,

    /// Write JSON files without indentation
    #[arg(long)]
    compact: bool,

    /// Offer only the default transfer syntax
    #[arg(long, conflicts_with = "bigendian")]
    defts: bool,

    /// Additionally offer Explicit VR Big Endian
    #[arg(long)]
    bigendian: bool,

    /// Maximum PDU length in bytes
    #[arg(long, default_value = "16384")]
    max_pdu_length: u32,

    /// Enforce the maximum PDU length on received PDUs
    #[arg(long)]
    strict: bool,

    /// Maximum number of simultaneous associations
    #[arg(long, default_value = "64")]
    max_associations: usize,

    /// Maximum number of outstanding asynchronous operations offered to
    /// the peer (1 = synchronous)
    #[arg(long = "async", value_name = "MAXOPS", default_value = "1")]
    async_ops: u16,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Enable TLS with the given cipher suite family
    #[arg(long, value_enum, value_name = "SUITE")]
    tls: Option<CipherSuiteArg>,

    /// Private key file (PEM), required with --tls
    #[arg(long, value_name = "FILE", requires = "tls")]
    key_file: Option<PathBuf>,

    /// Certificate file (PEM), required with --tls
    #[arg(long, value_name = "FILE", requires = "tls")]
    cert_file: Option<PathBuf>,

    /// Trusted certificates file (PEM)
    #[arg(long, value_name = "FILE", requires = "tls")]
    trust_file: Option<PathBuf>,

    /// Password for an encrypted private key
    #[arg(long, value_name = "PASSWORD", requires = "tls")]
    key_password: Option<String>,

    /// Password for an encrypted trust store
    #[arg(long, value_name = "PASSWORD", requires = "tls")]
    trust_password: Option<String>,

    /// Do not require peer certificates
    #[arg(long, requires = "tls")]
    no_client_auth: bool,

    /// Enabled TLS protocol versions
    #[arg(long, value_name = "PROTOCOL", default_values = ["TLSv1.2", "TLSv1.3"])]
    tls_protocol: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CipherSuiteArg {
    /// Authentication without encryption
    Null,
    #[value(name = "3des")]
    TripleDes,
    Aes,
}

impl From<CipherSuiteArg> for TlsCipherSuite {
    fn from(value: CipherSuiteArg) -> Self {
        match value {
            CipherSuiteArg::Null => TlsCipherSuite::Null,
            CipherSuiteArg::TripleDes => TlsCipherSuite::TripleDes,
            CipherSuiteArg::Aes => TlsCipherSuite::Aes,
        }
    }
}

fn open_store(dir: PathBuf, codec: Arc<dyn RecordCodec>) -> Result<Arc<RecordStore>, ExitCode> {
    match RecordStore::new(dir, codec) {
        Ok(store) => Ok(Arc::new(store)),
        Err(e) => {
            error!("{}", Report::from_error(e));
            Err(ExitCode::from(1))
        }
    }
}

fn register_mpps(registry: &mut ServiceRegistry, store: Arc<RecordStore>) {
    let (tx, _task) = status_channel(Box::new(LogStatusListener), 100);
    let service: Arc<dyn DimseHandler> =
        Arc::new(MppsService::new(store).with_status_events(tx));
    registry.register(
        MODALITY_PERFORMED_PROCEDURE_STEP,
        DimseOp::NCreate,
        service.clone(),
    );
    registry.register(MODALITY_PERFORMED_PROCEDURE_STEP, DimseOp::NSet, service);
}

fn register_notification(
    registry: &mut ServiceRegistry,
    sop_class_uid: &'static str,
    store: Arc<RecordStore>,
) {
    let service: Arc<dyn DimseHandler> = Arc::new(NotificationService::new(sop_class_uid, store));
    registry.register(sop_class_uid, DimseOp::NCreate, service);
}

fn run(cli: Cli) -> Result<(), ExitCode> {
    let (aet, host, port) = parse_endpoint(&cli.addr).map_err(|e| {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        error!("{}", e);
        ExitCode::from(1)
    })?;

    let mut config = ServerConfig {
        port,
        strict: cli.strict,
        max_pdu_length: cli.max_pdu_length,
        max_associations: cli.max_associations,
        max_outstanding_ops: cli.async_ops,
        ..ServerConfig::default()
    };
    if let Some(aet) = aet {
        config.ae_title = aet;
    }
    if let Some(host) = host {
        config.host = host;
    }
    if cli.defts {
        config.transfer_syntaxes = TransferSyntaxPreset::DefaultOnly;
    } else if cli.bigendian {
        config.transfer_syntaxes = TransferSyntaxPreset::Native;
    }

    let tls = match cli.tls {
        Some(suite) => {
            let (Some(key_file), Some(cert_file)) = (cli.key_file, cli.cert_file) else {
                error!("--tls requires --key-file and --cert-file");
                return Err(ExitCode::from(1));
            };
            let tls_config = TlsConfig {
                cipher_suite: suite.into(),
                protocols: cli.tls_protocol,
                need_client_auth: !cli.no_client_auth,
                key_file,
                cert_file,
                trust_file: cli.trust_file,
                key_password: cli.key_password,
                trust_password: cli.trust_password,
            };
            match init_tls(tls_config) {
                Ok(material) => Some(material),
                Err(e) => {
                    error!("{}", Report::from_error(e));
                    return Err(ExitCode::from(2));
                }
            }
        }
        None => None,
    };

    let runtime = tokio::runtime::Runtime::new().map_err(|e| {
        error!("could not start async runtime: {}", e);
        ExitCode::from(1)
    })?;

    runtime.block_on(async {
        let dicom_codec: Arc<dyn RecordCodec> = Arc::new(DicomCodec);
        let json_codec: Arc<dyn RecordCodec> = Arc::new(JsonCodec::new(!cli.compact));

        let mut registry = ServiceRegistry::new();
        if let Some(dir) = cli.mpps {
            register_mpps(&mut registry, open_store(dir, dicom_codec.clone())?);
        }
        if let Some(dir) = cli.mpps_json {
            register_mpps(&mut registry, open_store(dir, json_codec.clone())?);
        }
        if let Some(dir) = cli.ian {
            register_notification(
                &mut registry,
                INSTANCE_AVAILABILITY_NOTIFICATION,
                open_store(dir, dicom_codec.clone())?,
            );
        }
        if let Some(dir) = cli.ian_json {
            register_notification(
                &mut registry,
                INSTANCE_AVAILABILITY_NOTIFICATION,
                open_store(dir, json_codec.clone())?,
            );
        }
        if let Some(dir) = cli.scn {
            register_notification(
                &mut registry,
                BASIC_STUDY_CONTENT_NOTIFICATION,
                open_store(dir, dicom_codec.clone())?,
            );
        }
        if let Some(dir) = cli.scn_json {
            register_notification(
                &mut registry,
                BASIC_STUDY_CONTENT_NOTIFICATION,
                open_store(dir, json_codec.clone())?,
            );
        }
        if registry.is_empty() {
            warn!("no services enabled, only C-ECHO will be answered");
        }

        let mut server = OrderFiller::new(config, registry);
        if let Some(tls) = tls {
            server = server.with_tls(tls);
        }
        let shutdown = server.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.notify_one();
            }
        });

        server.run().await.map_err(|e| {
            error!("{}", Report::from_error(e));
            ExitCode::from(1)
        })
    })
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // help and version are not errors
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "info" })
            }),
        )
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}
