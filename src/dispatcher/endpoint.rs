//! Endpoint dispatchers and the table that routes messages to them.

use std::{fmt, sync::Arc};

use url::Url;

use super::{
    ActionMessageFilter,
    AndMessageFilter,
    DispatchRuntime,
    EndpointAddressMessageFilter,
    HostNameComparisonMode,
    MatchAllMessageFilter,
    MessageFilter,
    PrefixEndpointAddressMessageFilter,
    PrefixEndpointAddressMessageFilterTable,
};
use crate::message::Message;

/// One endpoint of a service: an address, a contract, and the runtime that
/// executes it.
pub struct EndpointDispatcher {
    address: Url,
    contract_name: String,
    prefix: bool,
    filter_priority: i32,
    filter: AndMessageFilter,
    runtime: Arc<DispatchRuntime>,
}

impl EndpointDispatcher {
    /// An endpoint accepting messages sent exactly to `address`.
    #[must_use]
    pub fn new(address: Url, contract_name: impl Into<String>, runtime: DispatchRuntime) -> Self {
        let runtime = Arc::new(runtime);
        Self {
            filter: build_filter(&address, false, &runtime),
            address,
            contract_name: contract_name.into(),
            prefix: false,
            filter_priority: 0,
            runtime,
        }
    }

    /// Accept messages sent to any address beneath this one as well.
    #[must_use]
    pub fn prefix(mut self) -> Self {
        self.prefix = true;
        self.filter = build_filter(&self.address, true, &self.runtime);
        self
    }

    /// Prefer this endpoint over lower priorities when both match.
    #[must_use]
    pub fn with_filter_priority(mut self, priority: i32) -> Self {
        self.filter_priority = priority;
        self
    }

    /// Endpoint address.
    #[must_use]
    pub fn address(&self) -> &Url { &self.address }

    /// Contract name.
    #[must_use]
    pub fn contract_name(&self) -> &str { &self.contract_name }

    /// Returns true if the address matches by prefix.
    #[must_use]
    pub fn is_prefix(&self) -> bool { self.prefix }

    /// Priority among matching endpoints.
    #[must_use]
    pub fn filter_priority(&self) -> i32 { self.filter_priority }

    /// Address and contract filter.
    #[must_use]
    pub fn filter(&self) -> &AndMessageFilter { &self.filter }

    /// Operations and extensions.
    #[must_use]
    pub fn runtime(&self) -> &Arc<DispatchRuntime> { &self.runtime }
}

fn build_filter(address: &Url, prefix: bool, runtime: &DispatchRuntime) -> AndMessageFilter {
    let mode = HostNameComparisonMode::StrongWildcard;
    let address_filter: Arc<dyn MessageFilter> = if prefix {
        Arc::new(PrefixEndpointAddressMessageFilter::with_mode(address.clone(), mode))
    } else {
        Arc::new(EndpointAddressMessageFilter::with_mode(address.clone(), mode))
    };
    let contract_filter: Arc<dyn MessageFilter> = if runtime.has_unhandled_operation() {
        Arc::new(MatchAllMessageFilter)
    } else {
        Arc::new(ActionMessageFilter::new(
            runtime.operations().map(|op| op.action().to_owned()),
        ))
    };
    AndMessageFilter::new(address_filter, contract_filter)
}

impl fmt::Debug for EndpointDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDispatcher")
            .field("address", &self.address.as_str())
            .field("contract_name", &self.contract_name)
            .field("prefix", &self.prefix)
            .field("filter_priority", &self.filter_priority)
            .finish_non_exhaustive()
    }
}

/// Result of routing a message.
#[derive(Clone, Debug)]
pub enum EndpointLookup {
    /// The endpoint that takes the message.
    Found(Arc<EndpointDispatcher>),
    /// Some endpoint owns the address but none accepts the action.
    ContractMismatch,
    /// No endpoint owns the address.
    NotFound,
}

/// Routes messages to the endpoints of a service.
///
/// Built once when the host opens and shared immutably afterwards.
/// Endpoints are indexed by address: a lookup only tests the endpoints
/// registered at exactly the message's address and those under its longest
/// matching prefix.
#[derive(Debug)]
pub struct EndpointDispatcherTable {
    endpoints: Vec<Arc<EndpointDispatcher>>,
    exact: PrefixEndpointAddressMessageFilterTable<usize>,
    prefixes: PrefixEndpointAddressMessageFilterTable<usize>,
}

impl EndpointDispatcherTable {
    /// Index `endpoints`, which keep their order for tie-breaking.
    #[must_use]
    pub fn new(endpoints: Vec<Arc<EndpointDispatcher>>) -> Self {
        let mode = HostNameComparisonMode::StrongWildcard;
        let mut exact = PrefixEndpointAddressMessageFilterTable::new(mode).exact_match(true);
        let mut prefixes = PrefixEndpointAddressMessageFilterTable::new(mode);
        for (index, endpoint) in endpoints.iter().enumerate() {
            let table = if endpoint.is_prefix() { &mut prefixes } else { &mut exact };
            table.add(endpoint.address(), index);
        }
        Self {
            endpoints,
            exact,
            prefixes,
        }
    }

    /// Every endpoint in registration order.
    #[must_use]
    pub fn endpoints(&self) -> &[Arc<EndpointDispatcher>] { &self.endpoints }

    /// Find the endpoint for `message`.
    ///
    /// Among matching endpoints the highest filter priority wins, then an
    /// exact address over a prefix, then the earliest registered.
    #[must_use]
    pub fn lookup(&self, message: &Message) -> EndpointLookup {
        let mut best: Option<usize> = None;
        let mut address_matched = false;
        let candidates = self
            .exact
            .candidates(message)
            .iter()
            .chain(self.prefixes.candidates(message))
            .copied();
        for index in candidates {
            let endpoint = &self.endpoints[index];
            let (matched, address) = endpoint.filter().match_with_address(message);
            address_matched |= address;
            if !matched {
                continue;
            }
            best = match best {
                Some(current) if !self.beats(index, current) => Some(current),
                _ => Some(index),
            };
        }
        match best {
            Some(index) => EndpointLookup::Found(Arc::clone(&self.endpoints[index])),
            None if address_matched => EndpointLookup::ContractMismatch,
            None => EndpointLookup::NotFound,
        }
    }

    fn beats(&self, candidate: usize, current: usize) -> bool {
        let (a, b) = (&self.endpoints[candidate], &self.endpoints[current]);
        let rank = |e: &EndpointDispatcher| (e.filter_priority(), !e.is_prefix());
        rank(a) > rank(b) || (rank(a) == rank(b) && candidate < current)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{
        dispatcher::{DispatchOperation, operation_fn},
        message::MessageVersion,
    };

    fn runtime(actions: &[&str]) -> DispatchRuntime {
        actions.iter().fold(DispatchRuntime::new(), |runtime, action| {
            runtime.with_operation(DispatchOperation::new(
                *action,
                *action,
                operation_fn(|_, _| async { Ok(()) }),
            ))
        })
    }

    fn endpoint(address: &str, contract: &str, actions: &[&str]) -> EndpointDispatcher {
        EndpointDispatcher::new(Url::parse(address).expect("uri"), contract, runtime(actions))
    }

    fn message(to: &str, action: &str) -> Message {
        let mut message = Message::new(MessageVersion::default(), action, ());
        message.headers_mut().set_to(to);
        message
    }

    fn found(lookup: EndpointLookup) -> String {
        match lookup {
            EndpointLookup::Found(endpoint) => endpoint.contract_name().to_owned(),
            other => panic!("expected an endpoint, got {other:?}"),
        }
    }

    #[rstest]
    #[case("net.tcp://localhost/calc", "urn:add", Some("Calc"))]
    #[case("net.tcp://localhost/calc", "urn:nope", None)]
    #[case("net.tcp://localhost/other", "urn:add", None)]
    fn routes_by_address_then_action(#[case] to: &str, #[case] action: &str, #[case] expected: Option<&str>) {
        let table = EndpointDispatcherTable::new(vec![Arc::new(endpoint(
            "net.tcp://localhost/calc",
            "Calc",
            &["urn:add"],
        ))]);
        let lookup = table.lookup(&message(to, action));
        match expected {
            Some(name) => assert_eq!(found(lookup), name),
            None => assert!(!matches!(lookup, EndpointLookup::Found(_))),
        }
    }

    #[test]
    fn address_match_without_action_is_a_contract_mismatch() {
        let table = EndpointDispatcherTable::new(vec![Arc::new(endpoint(
            "net.tcp://localhost/calc",
            "Calc",
            &["urn:add"],
        ))]);
        assert!(matches!(
            table.lookup(&message("net.tcp://localhost/calc", "urn:sub")),
            EndpointLookup::ContractMismatch
        ));
        assert!(matches!(
            table.lookup(&message("net.tcp://localhost/none", "urn:add")),
            EndpointLookup::NotFound
        ));
    }

    #[test]
    fn two_contracts_share_an_address() {
        let table = EndpointDispatcherTable::new(vec![
            Arc::new(endpoint("net.tcp://localhost/svc", "Calc", &["urn:add"])),
            Arc::new(endpoint("net.tcp://localhost/svc", "Echo", &["urn:echo"])),
        ]);
        assert_eq!(found(table.lookup(&message("net.tcp://localhost/svc", "urn:echo"))), "Echo");
        assert_eq!(found(table.lookup(&message("net.tcp://localhost/svc", "urn:add"))), "Calc");
    }

    #[test]
    fn priority_then_registration_order_breaks_ties() {
        let wildcard = |name: &str| endpoint("net.tcp://localhost/svc", name, &["*"]);
        let table = EndpointDispatcherTable::new(vec![
            Arc::new(wildcard("First")),
            Arc::new(wildcard("Second")),
        ]);
        assert_eq!(found(table.lookup(&message("net.tcp://localhost/svc", "urn:x"))), "First");

        let table = EndpointDispatcherTable::new(vec![
            Arc::new(wildcard("Low")),
            Arc::new(wildcard("High").with_filter_priority(5)),
        ]);
        assert_eq!(found(table.lookup(&message("net.tcp://localhost/svc", "urn:x"))), "High");
    }

    #[test]
    fn prefix_endpoints_take_longer_addresses() {
        let table = EndpointDispatcherTable::new(vec![
            Arc::new(endpoint("net.tcp://localhost/svc", "Exact", &["urn:a"])),
            Arc::new(endpoint("net.tcp://localhost/svc/files", "Files", &["urn:a"]).prefix()),
        ]);
        assert_eq!(
            found(table.lookup(&message("net.tcp://localhost/svc/files/report.txt", "urn:a"))),
            "Files"
        );
        assert_eq!(found(table.lookup(&message("net.tcp://localhost/svc", "urn:a"))), "Exact");
        assert!(matches!(
            table.lookup(&message("net.tcp://localhost/svc/other", "urn:a")),
            EndpointLookup::NotFound
        ));
    }

    #[test]
    fn exact_address_wins_over_a_prefix_at_the_same_path() {
        let table = EndpointDispatcherTable::new(vec![
            Arc::new(endpoint("net.tcp://localhost/svc", "Prefix", &["urn:a"]).prefix()),
            Arc::new(endpoint("net.tcp://localhost/svc", "Exact", &["urn:a"])),
            Arc::new(endpoint("net.tcp://localhost/svc/admin", "Admin", &["urn:a"])),
        ]);
        assert_eq!(found(table.lookup(&message("net.tcp://localhost/svc", "urn:a"))), "Exact");
        assert_eq!(found(table.lookup(&message("net.tcp://localhost/svc/orders", "urn:a"))), "Prefix");
        assert_eq!(found(table.lookup(&message("net.tcp://localhost/svc/admin", "urn:a"))), "Admin");
        assert_eq!(
            found(table.lookup(&message("net.tcp://localhost/svc/admin/x", "urn:a"))),
            "Prefix"
        );
    }

    #[test]
    fn priority_outranks_exactness() {
        let table = EndpointDispatcherTable::new(vec![
            Arc::new(endpoint("net.tcp://localhost/svc", "Exact", &["urn:a"])),
            Arc::new(
                endpoint("net.tcp://localhost/svc", "Prefix", &["urn:a"])
                    .prefix()
                    .with_filter_priority(1),
            ),
        ]);
        assert_eq!(found(table.lookup(&message("net.tcp://localhost/svc", "urn:a"))), "Prefix");
    }
}
