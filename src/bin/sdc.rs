//! SDC demo CLI: a thin command-line driver over [`flexsim::sdc::SdcService`]
//! exercising the CONNECT/READ/WRITE/DISCONNECT surface spec.md §4.10
//! describes. Not a full NBD device — just enough to exercise the planner/
//! executor path end to end (SPEC_FULL.md's explicit non-goal on real block
//! device exposure).
//!
//! Usage:
//!   sdc connect <volume_id>
//!   sdc read <volume_id> <offset_bytes> <length_bytes>
//!   sdc write <volume_id> <offset_bytes> <hex_data>
//!   sdc disconnect <volume_id>

use std::sync::Arc;

use base64::Engine;
use colored::Colorize;
use flexsim::config::ServiceConfig;
use flexsim::model::VolumeId;
use flexsim::sdc::SdcService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Arc::new(ServiceConfig::from_env());
    if let Err(err) = config.validate() {
        log::error!("{}", format!("startup profile invalid: {err}").red());
        anyhow::bail!(err);
    }

    let node_id = std::env::var("FLEXSIM_NODE_ID").unwrap_or_else(|_| "sdc-1".to_string());
    let service = Arc::new(SdcService::new(node_id.clone(), config.clone()));
    service.register_with_mdm().await?;
    service.spawn_heartbeat_sender();

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1) else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "connect" => {
            let volume_id = parse_volume_id(&args)?;
            service.connect(volume_id).await?;
            println!("connected to volume {volume_id}");
        }
        "disconnect" => {
            let volume_id = parse_volume_id(&args)?;
            service.disconnect(volume_id).await;
            println!("disconnected from volume {volume_id}");
        }
        "read" => {
            let volume_id = parse_volume_id(&args)?;
            let offset: u64 = args.get(3).ok_or_else(|| anyhow::anyhow!("missing offset"))?.parse()?;
            let length: u64 = args.get(4).ok_or_else(|| anyhow::anyhow!("missing length"))?.parse()?;
            service.connect(volume_id).await?;
            let data = service.read(volume_id, offset, length).await?;
            println!("{}", base64::engine::general_purpose::STANDARD.encode(&data));
        }
        "write" => {
            let volume_id = parse_volume_id(&args)?;
            let offset: u64 = args.get(3).ok_or_else(|| anyhow::anyhow!("missing offset"))?.parse()?;
            let hex_data = args.get(4).ok_or_else(|| anyhow::anyhow!("missing data"))?;
            let data = hex::decode(hex_data)?;
            service.connect(volume_id).await?;
            let written = service.write(volume_id, offset, &data).await?;
            println!("wrote {written} bytes");
        }
        other => {
            log::error!("unknown command: {other}");
            print_usage();
        }
    }

    Ok(())
}

fn parse_volume_id(args: &[String]) -> anyhow::Result<VolumeId> {
    let raw = args.get(2).ok_or_else(|| anyhow::anyhow!("missing volume_id"))?;
    Ok(VolumeId(raw.parse()?))
}

fn print_usage() {
    eprintln!("usage: sdc <connect|disconnect|read|write> <volume_id> [offset] [length|hex_data]");
}
