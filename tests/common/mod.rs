//! Helpers shared by the integration tests.
#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::sync::Arc;

use corewcf::{
    config::TransportSettings,
    dispatcher::UriPrefixTable,
    encoding::{MessageEncoder, TextMessageEncoder},
    transport::ChannelListener,
};
use url::Url;

pub const VIA: &str = "net.tcp://localhost/calculator";
pub const SOAP12: &str = "application/soap+xml; charset=utf-8";

pub fn url(s: &str) -> Url { Url::parse(s).expect("valid uri") }

pub fn text() -> Arc<dyn MessageEncoder> { Arc::new(TextMessageEncoder::soap12()) }

/// An open listener at [`VIA`] and a resolver that finds it.
pub fn routed_listener(
    settings: TransportSettings,
) -> (UriPrefixTable<Arc<ChannelListener>>, Arc<ChannelListener>) {
    let listener = Arc::new(ChannelListener::with_settings(url(VIA), text(), settings, 8));
    listener.open().expect("open listener");
    let mut table = UriPrefixTable::default();
    table
        .insert(listener.uri(), Arc::clone(&listener))
        .expect("register");
    (table, listener)
}
