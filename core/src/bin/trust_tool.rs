use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use keychange_core::reconcile::{DeliveryRequest, ReconcileOutcome};
use keychange_core::store::{FileStore, IdentityStorage, MemoryStore, MessageStorage};
use keychange_core::{ReconcileConfig, TrustAPI};

const USAGE: &str = "usage: trust_tool <pending THREAD | accept MESSAGE_ID RECIPIENT | fingerprint RECIPIENT>";

fn main() -> Result<(), Box<dyn Error>> {
    let config_path = std::env::var("KEYCHANGE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("keychange.json"));
    let config = ReconcileConfig::load(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .max_blocking_threads(config.worker_threads)
        .enable_all()
        .build()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    runtime.block_on(run(&config, &args))
}

async fn run(config: &ReconcileConfig, args: &[String]) -> Result<(), Box<dyn Error>> {
    let (identities, messages) = match &config.data_dir {
        Some(dir) => {
            let store = Arc::new(FileStore::open(dir)?);
            info!("Using file store in {}", store.dir().display());
            (store.clone() as Arc<dyn IdentityStorage>, store as Arc<dyn MessageStorage>)
        }
        None => {
            info!("No data_dir configured, using an empty in-memory store");
            let store = Arc::new(MemoryStore::new());
            (store.clone() as Arc<dyn IdentityStorage>, store as Arc<dyn MessageStorage>)
        }
    };
    let api = TrustAPI::with_storage(identities, Arc::clone(&messages), tokio::runtime::Handle::current());

    match args {
        [cmd, thread] if cmd == "pending" => {
            let thread_id = thread.parse()?;
            let pending = api.pending_mismatches(thread_id)?;
            if pending.is_empty() {
                println!("No pending mismatches in thread {}", thread_id);
            }
            for mismatch in pending {
                println!(
                    "message {}  recipient {}  key {}",
                    mismatch.message_id, mismatch.recipient_id, mismatch.identity_key
                );
            }
        }
        [cmd, message, recipient] if cmd == "accept" => {
            let message_id = message.parse()?;
            let recipient_id: u64 = recipient.parse()?;

            let record = messages.read_message_record(message_id)?;
            let Some(mismatch) = record
                .mismatches
                .iter()
                .find(|m| m.recipient_id == recipient_id)
                .cloned()
            else {
                println!("Message {} has no mismatch for recipient {}", message_id, recipient_id);
                return Ok(());
            };

            match api.submit(message_id, mismatch)?.wait().await {
                ReconcileOutcome::Completed(report) => {
                    println!(
                        "Reconciled {} message(s), {} already clear, {} failed",
                        report.reconciled.len(),
                        report.already_clear,
                        report.failed.len()
                    );
                    for (id, reason) in &report.failed {
                        println!("  message {} left flagged: {}", id, reason);
                    }
                }
                ReconcileOutcome::Aborted { last_state, reason, .. } => {
                    error!("Aborted after {:?}: {}", last_state, reason);
                    return Err(reason.into());
                }
                ReconcileOutcome::Rejected => {}
            }

            while let Some(request) = api.next_delivery() {
                match request {
                    DeliveryRequest::Resend { message_id, thread_id } => {
                        info!("Resend requested for message {} in thread {}", message_id, thread_id)
                    }
                    DeliveryRequest::Reprocess { message_id } => {
                        info!("Reprocessing requested for message {}", message_id)
                    }
                }
            }
        }
        [cmd, recipient] if cmd == "fingerprint" => {
            let recipient_id = recipient.parse()?;
            match api.fingerprint(recipient_id)? {
                Some(fingerprint) => println!("{}", fingerprint),
                None => println!("No identity on record for recipient {}", recipient_id),
            }
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }

    Ok(())
}
