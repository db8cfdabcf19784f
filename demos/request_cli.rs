//! Minimal CoAP client.
//!
//! ```text
//! request_cli <url> [get|post|put|delete] [--observe] [--format <media-type>] [--data <text>]
//! ```

use std::env;

use anyhow::{anyhow, bail, Context};
use coap_lite::RequestType;
use coap_node::client::{Call, ClientEvent, Requestor};
use coap_node::codec::{MediaType, Payload};
use coap_node::config::RequestConfig;
use futures::StreamExt;
use log::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let url = args.next().ok_or_else(|| anyhow!("missing url"))?;
    let mut builder = RequestConfig::builder().url(url);
    let mut data = None;
    let mut format = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--observe" => builder = builder.observe(),
            "--format" => {
                let name = args.next().context("--format needs a media type")?;
                let media_type: MediaType = name.parse()?;
                format = Some(media_type);
                builder = builder.content_format(media_type);
            }
            "--data" => data = Some(args.next().context("--data needs a value")?),
            method => builder = builder.method(parse_method(method)?),
        }
    }

    let mut requestor = Requestor::new(builder.build()?);
    let mut call = Call::new(());
    if let Some(data) = data {
        call = call.payload(to_payload(&data, format)?);
    }

    let mut exchange = requestor.request(call).await?;
    while let Some(event) = exchange.next().await {
        match event {
            ClientEvent::Response(response) => {
                info!("{:?} from {}", response.status, response.headers.source);
                println!("{}", response.payload.to_text()?);
            }
            ClientEvent::Status(status) => info!("status: {status:?}"),
        }
    }
    Ok(())
}

fn parse_method(raw: &str) -> anyhow::Result<RequestType> {
    Ok(match raw.to_ascii_lowercase().as_str() {
        "get" => RequestType::Get,
        "post" => RequestType::Post,
        "put" => RequestType::Put,
        "delete" => RequestType::Delete,
        "fetch" => RequestType::Fetch,
        "patch" => RequestType::Patch,
        "ipatch" => RequestType::IPatch,
        other => bail!("unknown argument {other:?}"),
    })
}

/// Structured formats take JSON on the command line; everything else is sent as text.
fn to_payload(data: &str, format: Option<MediaType>) -> anyhow::Result<Payload> {
    match format {
        Some(MediaType::ApplicationJson | MediaType::ApplicationCbor) => {
            let value: serde_json::Value = serde_json::from_str(data)?;
            Ok(Payload::Json(value))
        }
        _ => Ok(Payload::Text(data.to_string())),
    }
}
