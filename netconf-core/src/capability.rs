//! Capability registry, negotiation, and load ordering.
//!
//! A capability is identified by a URI with an optional trailing version
//! token and an optional query string:
//!
//! ```text
//! urn:ietf:params:netconf:capability:url:1.0?scheme=http,ftp,file
//! \_______________________________________/ \_/ \________________/
//!                 keyword                 version      query
//! ```
//!
//! Two capabilities are compatible when keyword and version are equal. The
//! negotiated query is the per-key intersection of both sides.

use crate::error::CapabilityError;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Parsed capability identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapabilityId {
    keyword: String,
    version: Option<(u32, u32)>,
    query: BTreeMap<String, BTreeSet<String>>,
}

fn parse_version(token: &str) -> Option<(u32, u32)> {
    let (major, minor) = token.split_once('.')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(major) || !digits(minor) {
        return None;
    }
    Some((major.parse().ok()?, minor.parse().ok()?))
}

impl CapabilityId {
    pub fn parse(id: &str) -> Result<Self, CapabilityError> {
        let id = id.trim();
        let (path, query) = match id.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (id, None),
        };
        if path.is_empty() {
            return Err(CapabilityError::invalid(id, "empty capability path"));
        }

        let (keyword, version) = match path.rsplit_once(':') {
            Some((head, last)) => match parse_version(last) {
                Some(version) if !head.is_empty() => (head.to_string(), Some(version)),
                _ => (path.to_string(), None),
            },
            None => (path.to_string(), None),
        };

        let mut params: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| CapabilityError::invalid(id, format!("query parameter '{}' has no value", pair)))?;
            if key.is_empty() {
                return Err(CapabilityError::invalid(id, "empty query parameter name"));
            }
            let values = params.entry(key.to_string()).or_default();
            for value in value.split(',').filter(|v| !v.is_empty()) {
                let decoded = urlencoding::decode(value)
                    .map_err(|e| CapabilityError::invalid(id, e.to_string()))?;
                values.insert(decoded.into_owned());
            }
        }

        Ok(Self {
            keyword,
            version,
            query: params,
        })
    }

    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    pub fn version(&self) -> Option<(u32, u32)> {
        self.version
    }

    pub fn query(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.query
    }

    /// The id without its query string. Registries are keyed by this.
    pub fn key(&self) -> String {
        match self.version {
            Some((major, minor)) => format!("{}:{}.{}", self.keyword, major, minor),
            None => self.keyword.clone(),
        }
    }

    pub fn is_compatible(&self, other: &CapabilityId) -> bool {
        self.keyword == other.keyword && self.version == other.version
    }

    /// Returns this id with its query reduced to the per-key intersection
    /// with `other`. Keys whose intersection is empty are dropped.
    pub fn intersect(&self, other: &CapabilityId) -> CapabilityId {
        let query = self
            .query
            .iter()
            .filter_map(|(key, values)| {
                let theirs = other.query.get(key)?;
                let common: BTreeSet<String> = values.intersection(theirs).cloned().collect();
                (!common.is_empty()).then(|| (key.clone(), common))
            })
            .collect();
        CapabilityId {
            keyword: self.keyword.clone(),
            version: self.version,
            query,
        }
    }

    fn satisfies(&self, dependency: &str) -> bool {
        dependency == self.keyword || dependency == self.key()
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())?;
        let mut separator = '?';
        for (key, values) in &self.query {
            let values: Vec<String> = values
                .iter()
                .map(|v| urlencoding::encode(v).into_owned())
                .collect();
            write!(f, "{}{}={}", separator, key, values.join(","))?;
            separator = '&';
        }
        Ok(())
    }
}

impl std::str::FromStr for CapabilityId {
    type Err = CapabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CapabilityId::parse(s)
    }
}

/// A registered capability and what it brings: operation handlers of type
/// `H` and model fragments.
#[derive(Debug, Clone)]
pub struct Capability<H> {
    pub id: CapabilityId,
    /// Features that must all be enabled for the capability to load.
    pub if_features: BTreeSet<String>,
    /// Keys or keywords of capabilities that must load first.
    pub dependencies: Vec<String>,
    pub operations: BTreeMap<String, H>,
    pub models: Vec<String>,
}

impl<H> Capability<H> {
    pub fn new(id: &str) -> Result<Self, CapabilityError> {
        Ok(Self {
            id: CapabilityId::parse(id)?,
            if_features: BTreeSet::new(),
            dependencies: Vec::new(),
            operations: BTreeMap::new(),
            models: Vec::new(),
        })
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.if_features.insert(feature.into());
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_operation(mut self, name: impl Into<String>, handler: H) -> Self {
        self.operations.insert(name.into(), handler);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.models.push(model.into());
        self
    }

    pub fn key(&self) -> String {
        self.id.key()
    }

    fn is_enabled(&self, features: Option<&BTreeSet<String>>) -> bool {
        match features {
            Some(enabled) => self.if_features.iter().all(|f| enabled.contains(f)),
            None => true,
        }
    }
}

/// Catalog of capabilities, optionally scoped to a set of enabled features.
///
/// Without a feature set every capability is enabled.
#[derive(Debug)]
pub struct CapabilityRegistry<H> {
    capabilities: BTreeMap<String, Arc<Capability<H>>>,
    features: Option<BTreeSet<String>>,
}

impl<H> Clone for CapabilityRegistry<H> {
    fn clone(&self) -> Self {
        Self {
            capabilities: self.capabilities.clone(),
            features: self.features.clone(),
        }
    }
}

impl<H> Default for CapabilityRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> CapabilityRegistry<H> {
    pub fn new() -> Self {
        Self {
            capabilities: BTreeMap::new(),
            features: None,
        }
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features = Some(features.into_iter().map(Into::into).collect());
        self
    }

    pub fn features(&self) -> Option<&BTreeSet<String>> {
        self.features.as_ref()
    }

    /// Adds a capability, replacing any previous one with the same key.
    pub fn register(&mut self, capability: Capability<H>) -> Option<Arc<Capability<H>>> {
        let key = capability.key();
        tracing::debug!("registering capability {}", key);
        self.capabilities.insert(key, Arc::new(capability))
    }

    /// Removes a capability by id or key.
    pub fn unregister(&mut self, id: &str) -> Result<Arc<Capability<H>>, CapabilityError> {
        let key = CapabilityId::parse(id)?.key();
        self.capabilities
            .remove(&key)
            .ok_or(CapabilityError::Unknown { id: id.to_string() })
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Capability<H>>> {
        let key = CapabilityId::parse(id).ok()?.key();
        self.capabilities.get(&key)
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Capabilities whose feature gates are satisfied.
    pub fn enabled(&self) -> impl Iterator<Item = &Arc<Capability<H>>> {
        let features = self.features.as_ref();
        self.capabilities.values().filter(move |c| c.is_enabled(features))
    }

    pub fn contains_keyword(&self, keyword: &str) -> bool {
        self.enabled().any(|c| c.id.keyword() == keyword)
    }

    pub fn highest_version(&self, keyword: &str) -> Option<(u32, u32)> {
        self.enabled()
            .filter(|c| c.id.keyword() == keyword)
            .filter_map(|c| c.id.version())
            .max()
    }

    /// Finds the handler for `operation`. When several capabilities register
    /// the same name, the highest version wins.
    pub fn find_operation(&self, operation: &str) -> Option<&H> {
        self.enabled()
            .filter_map(|c| c.operations.get(operation).map(|h| (c.id.version(), h)))
            .max_by_key(|(version, _)| *version)
            .map(|(_, handler)| handler)
    }

    /// Ids of all capabilities that can load, in dependency order.
    ///
    /// A capability can load if it is enabled and every dependency is
    /// satisfied by another capability that can load.
    pub fn loadable_order(&self) -> Result<Vec<String>, CapabilityError> {
        let mut loadable: Vec<&Arc<Capability<H>>> = self.enabled().collect();
        loop {
            let before = loadable.len();
            let snapshot = loadable.clone();
            loadable.retain(|cap| {
                cap.dependencies.iter().all(|dep| {
                    snapshot
                        .iter()
                        .any(|other| other.key() != cap.key() && other.id.satisfies(dep))
                })
            });
            if loadable.len() == before {
                break;
            }
        }

        let mut graph: DiGraph<&Arc<Capability<H>>, ()> = DiGraph::new();
        let nodes: HashMap<String, NodeIndex> = loadable
            .iter()
            .map(|cap| (cap.key(), graph.add_node(*cap)))
            .collect();
        for cap in &loadable {
            let to = nodes[&cap.key()];
            for dep in &cap.dependencies {
                for other in loadable.iter().filter(|o| o.key() != cap.key() && o.id.satisfies(dep)) {
                    graph.add_edge(nodes[&other.key()], to, ());
                }
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| CapabilityError::CyclicDependency {
            id: graph[cycle.node_id()].id.to_string(),
        })?;
        Ok(order.into_iter().map(|n| graph[n].id.to_string()).collect())
    }
}

impl<H: Clone> CapabilityRegistry<H> {
    /// Negotiates against the ids a peer advertised.
    ///
    /// Every enabled local capability with a compatible remote id is kept
    /// with its query narrowed to the intersection. Per keyword only the
    /// highest matching version survives. Unparsable remote ids are skipped.
    pub fn negotiate<S: AsRef<str>>(&self, remote: &[S]) -> CapabilityRegistry<H> {
        let remote: Vec<CapabilityId> = remote
            .iter()
            .filter_map(|id| match CapabilityId::parse(id.as_ref()) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    tracing::warn!("ignoring peer capability: {}", e);
                    None
                }
            })
            .collect();

        let mut best: BTreeMap<String, Capability<H>> = BTreeMap::new();
        for local in self.enabled() {
            let matched = remote
                .iter()
                .filter(|r| local.id.is_compatible(r))
                .map(|r| local.id.intersect(r))
                .max_by_key(|id| id.query().len());
            let Some(id) = matched else { continue };

            let keep = match best.get(local.id.keyword()) {
                Some(current) => id.version() > current.id.version(),
                None => true,
            };
            if keep {
                let mut negotiated = Capability::clone(local);
                negotiated.id = id;
                best.insert(local.id.keyword().to_string(), negotiated);
            }
        }

        CapabilityRegistry {
            capabilities: best
                .into_values()
                .map(|cap| (cap.key(), Arc::new(cap)))
                .collect(),
            features: self.features.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn registry(caps: &[(&str, &[&str])]) -> CapabilityRegistry<()> {
        let mut reg = CapabilityRegistry::new();
        for (id, deps) in caps {
            let mut cap = Capability::new(id).unwrap();
            for dep in *deps {
                cap = cap.with_dependency(*dep);
            }
            reg.register(cap);
        }
        reg
    }

    #[test]
    fn test_parse_versioned_id() {
        let id = CapabilityId::parse("urn:ietf:params:netconf:base:1.1").unwrap();
        assert_eq!(id.keyword(), "urn:ietf:params:netconf:base");
        assert_eq!(id.version(), Some((1, 1)));
        assert!(id.query().is_empty());
        assert_eq!(id.key(), "urn:ietf:params:netconf:base:1.1");
    }

    #[test]
    fn test_parse_query_and_decode() {
        let id = CapabilityId::parse(
            "urn:ietf:params:netconf:capability:url:1.0?scheme=http,ftp,file&note=a%20b",
        )
        .unwrap();
        assert_eq!(id.version(), Some((1, 0)));
        let schemes: Vec<&str> = id.query()["scheme"].iter().map(String::as_str).collect();
        assert_eq!(schemes, vec!["file", "ftp", "http"]);
        assert!(id.query()["note"].contains("a b"));
        assert_eq!(
            id.to_string(),
            "urn:ietf:params:netconf:capability:url:1.0?note=a%20b&scheme=file,ftp,http"
        );
    }

    #[test]
    fn test_parse_unversioned_and_invalid() {
        let id = CapabilityId::parse("http://example.com/module?module=m&revision=2024-01-01").unwrap();
        assert_eq!(id.keyword(), "http://example.com/module");
        assert_eq!(id.version(), None);

        assert!(CapabilityId::parse("").is_err());
        assert!(CapabilityId::parse("urn:x:1.0?novalue").is_err());
        assert!(CapabilityId::parse("urn:x:1.0?=v").is_err());
    }

    #[test]
    fn test_loadable_order_respects_dependencies() {
        let reg = registry(&[
            ("urn:ietf:params:netconf:capability:interleave:1.0", &["urn:ietf:params:netconf:capability:notification"]),
            ("urn:ietf:params:netconf:capability:notification:1.0", &["urn:ietf:params:netconf:base"]),
            ("urn:ietf:params:netconf:base:1.0", &[]),
        ]);
        let order = reg.loadable_order().unwrap();
        assert_eq!(
            order,
            vec![
                "urn:ietf:params:netconf:base:1.0",
                "urn:ietf:params:netconf:capability:notification:1.0",
                "urn:ietf:params:netconf:capability:interleave:1.0",
            ]
        );
    }

    #[test]
    fn test_loadable_order_detects_cycle() {
        let reg = registry(&[("urn:a:1.0", &["urn:b"]), ("urn:b:1.0", &["urn:a"])]);
        assert!(matches!(
            reg.loadable_order(),
            Err(CapabilityError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_unsatisfied_dependency_is_not_loadable() {
        let reg = registry(&[("urn:a:1.0", &["urn:missing"]), ("urn:b:1.0", &["urn:a:1.0"]), ("urn:c:1.0", &[])]);
        assert_eq!(reg.loadable_order().unwrap(), vec!["urn:c:1.0"]);
    }

    #[test]
    fn test_feature_gates() {
        let mut reg: CapabilityRegistry<()> = CapabilityRegistry::new().with_features(["candidate"]);
        reg.register(Capability::new("urn:cand:1.0").unwrap().with_feature("candidate"));
        reg.register(Capability::new("urn:start:1.0").unwrap().with_feature("startup"));
        reg.register(Capability::new("urn:base:1.0").unwrap());
        let order = reg.loadable_order().unwrap();
        assert!(order.contains(&"urn:cand:1.0".to_string()));
        assert!(order.contains(&"urn:base:1.0".to_string()));
        assert!(!order.contains(&"urn:start:1.0".to_string()));
    }

    #[test]
    fn test_negotiate_keeps_highest_version() {
        let reg = registry(&[
            ("urn:ietf:params:netconf:base:1.0", &[]),
            ("urn:ietf:params:netconf:base:1.1", &[]),
            ("urn:ietf:params:netconf:capability:xpath:1.0", &[]),
        ]);
        let negotiated = reg.negotiate(&[
            "urn:ietf:params:netconf:base:1.0",
            "urn:ietf:params:netconf:base:1.1",
            "not a capability?x",
        ]);
        assert_eq!(negotiated.len(), 1);
        assert_eq!(
            negotiated.highest_version("urn:ietf:params:netconf:base"),
            Some((1, 1))
        );
        assert!(!negotiated.contains_keyword("urn:ietf:params:netconf:capability:xpath"));

        let old = reg.negotiate(&["urn:ietf:params:netconf:base:1.0"]);
        assert_eq!(old.highest_version("urn:ietf:params:netconf:base"), Some((1, 0)));
    }

    #[test]
    fn test_negotiate_version_mismatch_drops() {
        let reg = registry(&[("urn:x:2.0", &[])]);
        assert!(reg.negotiate(&["urn:x:1.0"]).is_empty());
    }

    #[test]
    fn test_find_operation_highest_version_wins() {
        let mut reg: CapabilityRegistry<&'static str> = CapabilityRegistry::new();
        reg.register(Capability::new("urn:base:1.0").unwrap().with_operation("get", "v10"));
        reg.register(Capability::new("urn:base:1.1").unwrap().with_operation("get", "v11"));
        assert_eq!(reg.find_operation("get"), Some(&"v11"));
        assert_eq!(reg.find_operation("commit"), None);

        reg.unregister("urn:base:1.1").unwrap();
        assert_eq!(reg.find_operation("get"), Some(&"v10"));
        assert!(matches!(
            reg.unregister("urn:base:1.1"),
            Err(CapabilityError::Unknown { .. })
        ));
    }

    fn value_set() -> impl Strategy<Value = BTreeSet<String>> {
        proptest::collection::btree_set("[a-e]", 0..5)
    }

    proptest! {
        #[test]
        fn prop_negotiated_query_is_intersection(
            local_a in value_set(),
            local_b in value_set(),
            remote_a in value_set(),
            remote_c in value_set(),
        ) {
            let render = |pairs: &[(&str, &BTreeSet<String>)]| {
                let query: Vec<String> = pairs
                    .iter()
                    .filter(|(_, v)| !v.is_empty())
                    .map(|(k, v)| format!("{}={}", k, v.iter().cloned().collect::<Vec<_>>().join(",")))
                    .collect();
                format!("urn:example:cap:1.0?{}", query.join("&"))
            };
            let local = render(&[("a", &local_a), ("b", &local_b)]);
            let remote = render(&[("a", &remote_a), ("c", &remote_c)]);

            let mut reg: CapabilityRegistry<()> = CapabilityRegistry::new();
            reg.register(Capability::new(&local).unwrap());
            let negotiated = reg.negotiate(&[remote]);
            let cap = negotiated.get("urn:example:cap:1.0").unwrap();

            let expected: BTreeSet<String> = local_a.intersection(&remote_a).cloned().collect();
            if expected.is_empty() {
                prop_assert!(cap.id.query().get("a").is_none());
            } else {
                prop_assert_eq!(cap.id.query().get("a"), Some(&expected));
            }
            prop_assert!(cap.id.query().get("b").is_none());
            prop_assert!(cap.id.query().get("c").is_none());
        }

        #[test]
        fn prop_chain_orders_dependencies_first(len in 1usize..12, seed in any::<u64>()) {
            let mut reg: CapabilityRegistry<()> = CapabilityRegistry::new();
            for i in 0..len {
                let mut cap = Capability::new(&format!("urn:cap{}:1.0", (i as u64 ^ seed) % 1000 + i as u64 * 1000)).unwrap();
                if i > 0 {
                    cap = cap.with_dependency(format!("urn:cap{}", ((i - 1) as u64 ^ seed) % 1000 + (i - 1) as u64 * 1000));
                }
                reg.register(cap);
            }
            let order = reg.loadable_order().unwrap();
            prop_assert_eq!(order.len(), len);
            for i in 1..len {
                let dep = format!("urn:cap{}:1.0", ((i - 1) as u64 ^ seed) % 1000 + (i - 1) as u64 * 1000);
                let cap = format!("urn:cap{}:1.0", (i as u64 ^ seed) % 1000 + i as u64 * 1000);
                let dep_pos = order.iter().position(|id| *id == dep).unwrap();
                let cap_pos = order.iter().position(|id| *id == cap).unwrap();
                prop_assert!(dep_pos < cap_pos);
            }
        }
    }
}
