//! Minimal binary demonstrating `corewcf` usage.
//!
//! Hosts an echo service at `net.tcp://localhost:8808/echo` until Ctrl-C.

use std::{error::Error, sync::Arc, time::Duration};

use corewcf::{
    DispatchOperation,
    DispatchRuntime,
    EndpointDescription,
    OperationError,
    ServiceHost,
    TransportManager,
    TransportSettings,
    encoding::{MessageEncoder, TextMessageEncoder},
    operation_fn,
};
use url::Url;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Enable structured logging for the demo.
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let runtime = DispatchRuntime::new().with_operation(DispatchOperation::new(
        "Echo",
        "urn:echo",
        operation_fn(|_, mut request| async move {
            request.read_body::<String>().map_err(OperationError::from)
        }),
    ));
    let encoder: Arc<dyn MessageEncoder> = Arc::new(TextMessageEncoder::soap12());
    let endpoint = EndpointDescription::new(
        Url::parse("net.tcp://localhost:8808/echo")?,
        "Echo",
        encoder,
        runtime,
    );
    let host = ServiceHost::builder().add_endpoint(endpoint).build()?;

    let transport = TransportManager::new(TransportSettings::default());
    host.open(&transport).await?;
    println!("Listening at net.tcp://localhost:8808/echo");

    tokio::signal::ctrl_c().await?;
    host.close(Duration::from_secs(10)).await?;
    transport.close().await;
    Ok(())
}
