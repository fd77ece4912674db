//! Message filters and the prefix-indexed filter table.
//!
//! Address filters look at the `To` header, falling back to the via the
//! message arrived on when the message version carries no addressing.

use std::{collections::HashSet, fmt, sync::Arc};

use url::Url;

use super::{HostNameComparisonMode, UriPrefixTable};
use crate::message::Message;

/// A predicate over a message.
pub trait MessageFilter: Send + Sync + fmt::Debug {
    /// Returns true if `message` satisfies the filter.
    fn matches(&self, message: &Message) -> bool;
}

/// Address a message is directed at.
fn target_address(message: &Message) -> Option<Url> {
    message
        .headers()
        .to()
        .or(message.properties().via.as_deref())
        .and_then(|to| Url::parse(to).ok())
}

/// Matches messages whose action is one of a fixed set.
#[derive(Clone, Debug, Default)]
pub struct ActionMessageFilter {
    actions: HashSet<String>,
}

impl ActionMessageFilter {
    /// A filter accepting any of `actions`.
    pub fn new<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    /// Actions accepted by this filter.
    pub fn actions(&self) -> impl Iterator<Item = &str> { self.actions.iter().map(String::as_str) }
}

impl MessageFilter for ActionMessageFilter {
    fn matches(&self, message: &Message) -> bool {
        self.actions
            .contains(message.headers().action().unwrap_or_default())
    }
}

/// Matches messages addressed exactly to one endpoint.
#[derive(Debug)]
pub struct EndpointAddressMessageFilter {
    address: Url,
    table: UriPrefixTable<()>,
}

impl EndpointAddressMessageFilter {
    /// Match `address`, ignoring the host name.
    #[must_use]
    pub fn new(address: Url) -> Self { Self::with_mode(address, HostNameComparisonMode::StrongWildcard) }

    /// Match `address`, comparing hosts according to `mode`.
    #[must_use]
    pub fn with_mode(address: Url, mode: HostNameComparisonMode) -> Self {
        let mut table = UriPrefixTable::new(mode).exact_match(true);
        table.get_or_insert_with(&address, || ());
        Self { address, table }
    }

    /// The endpoint address.
    #[must_use]
    pub fn address(&self) -> &Url { &self.address }
}

impl MessageFilter for EndpointAddressMessageFilter {
    fn matches(&self, message: &Message) -> bool {
        target_address(message).is_some_and(|to| self.table.lookup(&to).is_some())
    }
}

/// Matches messages addressed to an endpoint or anything beneath it.
#[derive(Debug)]
pub struct PrefixEndpointAddressMessageFilter {
    address: Url,
    table: UriPrefixTable<()>,
}

impl PrefixEndpointAddressMessageFilter {
    /// Match `address` and longer paths, ignoring the host name.
    #[must_use]
    pub fn new(address: Url) -> Self { Self::with_mode(address, HostNameComparisonMode::StrongWildcard) }

    /// Match `address` and longer paths, comparing hosts according to
    /// `mode`.
    #[must_use]
    pub fn with_mode(address: Url, mode: HostNameComparisonMode) -> Self {
        let mut table = UriPrefixTable::new(mode);
        table.get_or_insert_with(&address, || ());
        Self { address, table }
    }

    /// The address prefix.
    #[must_use]
    pub fn address(&self) -> &Url { &self.address }
}

impl MessageFilter for PrefixEndpointAddressMessageFilter {
    fn matches(&self, message: &Message) -> bool {
        target_address(message).is_some_and(|to| self.table.lookup(&to).is_some())
    }
}

/// Conjunction of two filters. The second is only consulted when the
/// first matches.
#[derive(Clone, Debug)]
pub struct AndMessageFilter {
    first: Arc<dyn MessageFilter>,
    second: Arc<dyn MessageFilter>,
}

impl AndMessageFilter {
    /// `first` and then `second`.
    #[must_use]
    pub fn new(first: Arc<dyn MessageFilter>, second: Arc<dyn MessageFilter>) -> Self {
        Self { first, second }
    }

    /// Match, also reporting whether the first filter matched on its own.
    ///
    /// With an address filter first and a contract filter second, a
    /// `(false, true)` result means the endpoint was right but the action
    /// was not.
    #[must_use]
    pub fn match_with_address(&self, message: &Message) -> (bool, bool) {
        if !self.first.matches(message) {
            return (false, false);
        }
        (self.second.matches(message), true)
    }
}

impl MessageFilter for AndMessageFilter {
    fn matches(&self, message: &Message) -> bool { self.match_with_address(message).0 }
}

/// Matches every message.
#[derive(Clone, Copy, Debug, Default)]
pub struct MatchAllMessageFilter;

impl MessageFilter for MatchAllMessageFilter {
    fn matches(&self, _: &Message) -> bool { true }
}

/// Matches no message.
#[derive(Clone, Copy, Debug, Default)]
pub struct MatchNoneMessageFilter;

impl MessageFilter for MatchNoneMessageFilter {
    fn matches(&self, _: &Message) -> bool { false }
}

/// Items indexed by address prefix.
///
/// A lookup only visits the items registered at the longest prefix of the
/// message's address, so the cost does not grow with the number of
/// endpoints under unrelated prefixes. With
/// [`exact_match`](Self::exact_match) only items registered at exactly the
/// message's address are returned.
#[derive(Debug)]
pub struct PrefixEndpointAddressMessageFilterTable<T> {
    table: UriPrefixTable<Vec<T>>,
}

impl<T> Default for PrefixEndpointAddressMessageFilterTable<T> {
    fn default() -> Self { Self::new(HostNameComparisonMode::default()) }
}

impl<T> PrefixEndpointAddressMessageFilterTable<T> {
    /// An empty table comparing hosts according to `mode`.
    #[must_use]
    pub fn new(mode: HostNameComparisonMode) -> Self {
        Self {
            table: UriPrefixTable::new(mode),
        }
    }

    /// Match whole addresses only.
    #[must_use]
    pub fn exact_match(mut self, exact: bool) -> Self {
        self.table = self.table.exact_match(exact);
        self
    }

    /// Add `item` under `prefix`. Items under the same prefix keep their
    /// insertion order.
    pub fn add(&mut self, prefix: &Url, item: T) {
        self.table.get_or_insert_with(prefix, Vec::new).push(item);
    }

    /// Number of distinct prefixes.
    #[must_use]
    pub fn prefix_count(&self) -> usize { self.table.len() }

    /// Items registered at the longest prefix of the message's address.
    pub fn candidates(&self, message: &Message) -> &[T] {
        target_address(message)
            .and_then(|to| self.table.lookup(&to))
            .map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::message::{FaultCode, MessageFault, MessageVersion};

    #[derive(Debug)]
    struct Panicking;

    impl MessageFilter for Panicking {
        fn matches(&self, _: &Message) -> bool { panic!("second filter consulted") }
    }

    fn url(s: &str) -> Url { Url::parse(s).expect("valid uri") }

    fn message(to: &str, action: &str) -> Message {
        let mut message = Message::new(MessageVersion::default(), action, ());
        message.headers_mut().set_to(to);
        message
    }

    #[rstest]
    #[case("net.tcp://localhost/calc", true)]
    #[case("net.tcp://remote:808/CALC", true)]
    #[case("net.tcp://localhost/calc/add", false)]
    #[case("net.tcp://localhost:9000/calc", false)]
    fn exact_address_filter(#[case] to: &str, #[case] expected: bool) {
        let filter = EndpointAddressMessageFilter::new(url("net.tcp://localhost/calc"));
        assert_eq!(filter.matches(&message(to, "urn:a")), expected);
    }

    #[test]
    fn prefix_filter_matches_whole_segments() {
        let filter = PrefixEndpointAddressMessageFilter::new(url("net.tcp://localhost/calc"));
        assert!(filter.matches(&message("net.tcp://localhost/calc/add", "urn:a")));
        assert!(!filter.matches(&message("net.tcp://localhost/calculator", "urn:a")));
    }

    #[test]
    fn address_falls_back_to_the_via() {
        let mut message = Message::new(MessageVersion::SOAP11, "urn:a", ());
        let filter = EndpointAddressMessageFilter::new(url("net.tcp://localhost/calc"));
        assert!(!filter.matches(&message));
        message.properties_mut().via = Some("net.tcp://localhost/calc".to_owned());
        assert!(filter.matches(&message));
    }

    #[test]
    fn and_filter_short_circuits_and_reports_the_address() {
        let filter = AndMessageFilter::new(Arc::new(MatchNoneMessageFilter), Arc::new(Panicking));
        assert_eq!(filter.match_with_address(&message("net.tcp://h/x", "urn:a")), (false, false));

        let filter = AndMessageFilter::new(
            Arc::new(EndpointAddressMessageFilter::new(url("net.tcp://localhost/calc"))),
            Arc::new(ActionMessageFilter::new(["urn:add"])),
        );
        assert_eq!(filter.match_with_address(&message("net.tcp://localhost/calc", "urn:add")), (true, true));
        assert_eq!(filter.match_with_address(&message("net.tcp://localhost/calc", "urn:sub")), (false, true));
        assert_eq!(filter.match_with_address(&message("net.tcp://localhost/other", "urn:add")), (false, false));
    }

    #[test]
    fn action_filter_ignores_fault_bodies() {
        let version = MessageVersion::default();
        let fault = Message::fault(version, MessageFault::new(FaultCode::sender(version.envelope), "x"));
        assert!(!ActionMessageFilter::new(["urn:add"]).matches(&fault));
        assert!(MatchAllMessageFilter.matches(&fault));
    }

    #[test]
    fn filter_table_returns_the_longest_prefix_bucket() {
        let mut table = PrefixEndpointAddressMessageFilterTable::default();
        table.add(&url("net.tcp://localhost/svc"), 1);
        table.add(&url("net.tcp://localhost/svc/admin"), 2);
        table.add(&url("net.tcp://localhost/svc"), 3);
        assert_eq!(table.prefix_count(), 2);
        assert_eq!(table.candidates(&message("net.tcp://localhost/svc/orders", "urn:a")), &[1, 3]);
        assert_eq!(table.candidates(&message("net.tcp://localhost/svc/admin/x", "urn:a")), &[2]);
        assert!(table.candidates(&message("net.tcp://localhost/other", "urn:a")).is_empty());
    }

    #[test]
    fn exact_filter_table_ignores_shorter_addresses() {
        let mut table = PrefixEndpointAddressMessageFilterTable::default().exact_match(true);
        table.add(&url("net.tcp://localhost/svc"), 1);
        table.add(&url("net.tcp://localhost/svc/admin"), 2);
        assert_eq!(table.candidates(&message("net.tcp://localhost/svc", "urn:a")), &[1]);
        assert_eq!(table.candidates(&message("net.tcp://localhost/svc/admin", "urn:a")), &[2]);
        assert!(table.candidates(&message("net.tcp://localhost/svc/orders", "urn:a")).is_empty());
    }
}
