//! Segment-aware longest-prefix lookup over URIs.

use std::collections::HashMap;

use url::Url;

/// Default port of `net.tcp` addresses.
pub const DEFAULT_NET_TCP_PORT: u16 = 808;

/// How host names take part in matching.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum HostNameComparisonMode {
    /// Ignore the host; scheme, port, and path decide.
    #[default]
    StrongWildcard,
    /// The host must match exactly (case-insensitively).
    Exact,
    /// Prefer an exact host, fall back to any host.
    WeakWildcard,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct BaseKey {
    scheme: String,
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug)]
struct Node<T> {
    item: Option<T>,
    children: HashMap<String, Node<T>>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            item: None,
            children: HashMap::new(),
        }
    }
}

/// Port of `uri`, filling in scheme defaults the URL parser does not know.
#[must_use]
pub fn effective_port(uri: &Url) -> Option<u16> {
    uri.port_or_known_default().or_else(|| match uri.scheme() {
        "net.tcp" => Some(DEFAULT_NET_TCP_PORT),
        _ => None,
    })
}

fn segments(uri: &Url) -> Vec<String> {
    uri.path()
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_ascii_lowercase)
        .collect()
}

/// Maps URI prefixes to items; a lookup returns the item registered at the
/// longest prefix of the query, comparing whole path segments.
///
/// ```
/// use corewcf::dispatcher::UriPrefixTable;
/// use url::Url;
///
/// let mut table = UriPrefixTable::default();
/// table.insert(&Url::parse("net.tcp://localhost/svc").unwrap(), "svc").unwrap();
/// table.insert(&Url::parse("net.tcp://localhost/svc/admin").unwrap(), "admin").unwrap();
///
/// let hit = |uri: &str| table.lookup(&Url::parse(uri).unwrap()).copied();
/// assert_eq!(hit("net.tcp://otherhost/svc/admin/users"), Some("admin"));
/// assert_eq!(hit("net.tcp://localhost/svc/orders"), Some("svc"));
/// assert_eq!(hit("net.tcp://localhost/svcx"), None);
/// ```
#[derive(Debug)]
pub struct UriPrefixTable<T> {
    mode: HostNameComparisonMode,
    exact_match: bool,
    roots: HashMap<BaseKey, Node<T>>,
    len: usize,
}

impl<T> Default for UriPrefixTable<T> {
    fn default() -> Self { Self::new(HostNameComparisonMode::default()) }
}

impl<T> UriPrefixTable<T> {
    /// An empty table comparing hosts according to `mode`.
    #[must_use]
    pub fn new(mode: HostNameComparisonMode) -> Self {
        Self {
            mode,
            exact_match: false,
            roots: HashMap::new(),
            len: 0,
        }
    }

    /// Only return items registered at exactly the queried path.
    #[must_use]
    pub fn exact_match(mut self, exact: bool) -> Self {
        self.exact_match = exact;
        self
    }

    /// Number of registered prefixes.
    #[must_use]
    pub fn len(&self) -> usize { self.len }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len == 0 }

    fn key(&self, uri: &Url, with_host: bool) -> BaseKey {
        BaseKey {
            scheme: uri.scheme().to_ascii_lowercase(),
            host: with_host.then(|| uri.host_str().unwrap_or_default().to_ascii_lowercase()),
            port: effective_port(uri),
        }
    }

    fn registration_key(&self, uri: &Url) -> BaseKey {
        self.key(uri, self.mode != HostNameComparisonMode::StrongWildcard)
    }

    /// Register `item` at `uri`.
    ///
    /// # Errors
    ///
    /// Returns the item back if the prefix is already registered.
    pub fn insert(&mut self, uri: &Url, item: T) -> Result<(), T> {
        let key = self.registration_key(uri);
        let mut node = self.roots.entry(key).or_default();
        for segment in segments(uri) {
            node = node.children.entry(segment).or_default();
        }
        if node.item.is_some() {
            return Err(item);
        }
        node.item = Some(item);
        self.len += 1;
        Ok(())
    }

    /// Item registered at exactly `uri`, registering `make()` there first if
    /// the prefix is free.
    pub fn get_or_insert_with(&mut self, uri: &Url, make: impl FnOnce() -> T) -> &mut T {
        let key = self.registration_key(uri);
        let mut node = self.roots.entry(key).or_default();
        for segment in segments(uri) {
            node = node.children.entry(segment).or_default();
        }
        if node.item.is_none() {
            self.len += 1;
        }
        node.item.get_or_insert_with(make)
    }

    /// Remove the item registered at exactly `uri`.
    pub fn remove(&mut self, uri: &Url) -> Option<T> {
        let key = self.registration_key(uri);
        let mut node = self.roots.get_mut(&key)?;
        for segment in segments(uri) {
            node = node.children.get_mut(&segment)?;
        }
        let item = node.item.take()?;
        self.len -= 1;
        Some(item)
    }

    /// Returns true if an item is registered at exactly `uri`.
    #[must_use]
    pub fn is_registered(&self, uri: &Url) -> bool {
        let segments = segments(uri);
        self.roots
            .get(&self.registration_key(uri))
            .and_then(|root| Self::walk(root, &segments, true))
            .is_some()
    }

    /// Item registered at the longest prefix of `uri`.
    #[must_use]
    pub fn lookup(&self, uri: &Url) -> Option<&T> {
        let segments = segments(uri);
        let by_host = |with_host| {
            self.roots
                .get(&self.key(uri, with_host))
                .and_then(|root| Self::walk(root, &segments, self.exact_match))
        };
        match self.mode {
            HostNameComparisonMode::StrongWildcard => by_host(false),
            HostNameComparisonMode::Exact => by_host(true),
            HostNameComparisonMode::WeakWildcard => {
                by_host(true).or_else(|| self.wildcard_fallback(uri, &segments))
            }
        }
    }

    fn wildcard_fallback(&self, uri: &Url, segments: &[String]) -> Option<&T> {
        let scheme = uri.scheme().to_ascii_lowercase();
        let port = effective_port(uri);
        self.roots
            .iter()
            .filter(|(key, _)| key.scheme == scheme && key.port == port)
            .filter_map(|(_, root)| Self::walk_depth(root, segments, self.exact_match))
            .max_by_key(|(depth, _)| *depth)
            .map(|(_, item)| item)
    }

    fn walk<'a>(root: &'a Node<T>, segments: &[String], exact: bool) -> Option<&'a T> {
        Self::walk_depth(root, segments, exact).map(|(_, item)| item)
    }

    fn walk_depth<'a>(root: &'a Node<T>, segments: &[String], exact: bool) -> Option<(usize, &'a T)> {
        let mut best = root.item.as_ref().map(|item| (0, item));
        let mut node = root;
        for (depth, segment) in segments.iter().enumerate() {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    if let Some(item) = &node.item {
                        best = Some((depth + 1, item));
                    }
                }
                None => break,
            }
        }
        match best {
            Some((depth, _)) if exact && depth != segments.len() => None,
            found => found,
        }
    }

    /// Every registered item, in no particular order.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        let mut stack: Vec<&Node<T>> = self.roots.values().collect();
        std::iter::from_fn(move || {
            while let Some(node) = stack.pop() {
                stack.extend(node.children.values());
                if let Some(item) = &node.item {
                    return Some(item);
                }
            }
            None
        })
    }
}
