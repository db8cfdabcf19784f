use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coap_node::app::{self, AppBuilder, CoapError, Observers, Request, Response};
use coap_node::codec::{MediaType, Payload};
use coap_node::config::ServerConfig;
use coap_node::{CoapServer, UdpTransport};
use log::info;
use serde_json::json;
use tokio::time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = ServerConfig::default();
    let server = CoapServer::bind(UdpTransport::from_config(&config)).await?;
    info!("Listening on {:?}", server.local_endpoint());

    let reading = Arc::new(AtomicU32::new(0));
    let observers = Observers::new();

    let ticker_reading = reading.clone();
    let ticker_observers = observers.clone();
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            ticker_reading.fetch_add(1, Ordering::SeqCst);
            ticker_observers.notify_change();
        }
    });

    server
        .serve(build_app(&config, reading, observers))
        .await?;
    Ok(())
}

fn build_app(
    config: &ServerConfig,
    reading: Arc<AtomicU32>,
    observers: Observers,
) -> AppBuilder<SocketAddr> {
    let reading_for_put = reading.clone();
    app::with_config(config)
        .resource(
            app::resource("/sensor")
                // Try `coap-client -s 10 -m get coap://localhost/sensor`, or the request_cli demo
                // with `--observe`.
                .observable(observers)
                .get(move |req: Request<SocketAddr>| handle_get_sensor(req, reading.clone())),
        )
        .resource(
            app::resource("/sensor/reset")
                .put(move |req: Request<SocketAddr>| handle_put_reset(req, reading_for_put.clone())),
        )
}

async fn handle_get_sensor(
    request: Request<SocketAddr>,
    reading: Arc<AtomicU32>,
) -> Result<Response, CoapError> {
    let t = reading.load(Ordering::SeqCst);
    Ok(request
        .new_response()
        .encoded(&json!({ "t": t }).into(), MediaType::ApplicationJson)?
        .finish())
}

async fn handle_put_reset(
    request: Request<SocketAddr>,
    reading: Arc<AtomicU32>,
) -> Result<Response, CoapError> {
    let value = match &request.payload {
        Payload::Empty => 0,
        other => other
            .to_text()?
            .trim()
            .parse()
            .map_err(|e| CoapError::bad_request(format!("not a number: {e}")))?,
    };
    reading.store(value, Ordering::SeqCst);
    Ok(request
        .new_response()
        .status(coap_lite::ResponseType::Changed)
        .finish())
}
