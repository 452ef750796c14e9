use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::endpoint::{Connector, Endpoint, Protocol};

/// Identity of a remote object: a name within an optional category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Identity {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: String::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        match s.split_once('/') {
            Some((category, name)) => Identity::new(name).with_category(category),
            None => Identity::new(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncodingVersion {
    pub major: u8,
    pub minor: u8,
}

impl Default for EncodingVersion {
    fn default() -> Self {
        Self { major: 1, minor: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InvocationMode {
    #[default]
    Twoway,
    Oneway,
    BatchOneway,
    Datagram,
    BatchDatagram,
}

impl InvocationMode {
    /// True when the caller waits for a reply.
    pub fn is_twoway(&self) -> bool {
        matches!(self, InvocationMode::Twoway)
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, InvocationMode::BatchOneway | InvocationMode::BatchDatagram)
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self, InvocationMode::Datagram | InvocationMode::BatchDatagram)
    }
}

/// Key of an established connection in the connection factory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub endpoint: Endpoint,
    pub connector: Connector,
    pub connection_id: String,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.endpoint, self.connector)?;
        if !self.connection_id.is_empty() {
            write!(f, " [{}]", self.connection_id)?;
        }
        Ok(())
    }
}

/// What a reference points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Endpoints embedded in the reference.
    Direct(Vec<Endpoint>),
    /// Adapter or replica group name, resolved through the locator.
    Location(Vec<String>),
    /// Identity only, resolved through the locator.
    WellKnown,
    /// Bound to one established connection.
    Fixed(ConnectionKey),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReferenceData {
    identity: Identity,
    facet: String,
    protocol: Protocol,
    encoding: EncodingVersion,
    mode: InvocationMode,
    target: Target,
    connection_id: String,
    cache_connection: bool,
    retry_max_attempts: Option<u32>,
    locator_cache_timeout: Option<Option<Duration>>,
}

/// Immutable description of a remote target.
///
/// A reference is cheap to clone. The `with_*` methods return a modified copy
/// and hand back the very same allocation when nothing changes, so callers can
/// compare with [`Reference::ptr_eq`] to detect a no-op modification.
///
/// # Example
///
/// ```
/// use lodestar_common::protocol::{Endpoint, Reference};
///
/// let printer = Reference::direct("printer", vec![Endpoint::tcp("10.0.0.1", 10000)]);
/// let same = printer.with_facet("");
/// assert!(Reference::ptr_eq(&printer, &same));
///
/// let admin = printer.with_facet("admin");
/// assert_eq!(admin.facet(), "admin");
/// assert_eq!(printer.facet(), "");
/// ```
#[derive(Debug, Clone)]
pub struct Reference(Arc<ReferenceData>);

impl Reference {
    fn from_target(identity: Identity, target: Target) -> Self {
        let protocol = match &target {
            Target::Direct(endpoints) => endpoints
                .first()
                .map(|e| e.protocol)
                .unwrap_or_default(),
            Target::Fixed(key) => key.endpoint.protocol,
            _ => Protocol::default(),
        };
        Reference(Arc::new(ReferenceData {
            identity,
            facet: String::new(),
            protocol,
            encoding: EncodingVersion::default(),
            mode: InvocationMode::default(),
            target,
            connection_id: String::new(),
            cache_connection: true,
            retry_max_attempts: None,
            locator_cache_timeout: None,
        }))
    }

    pub fn direct(identity: impl Into<Identity>, endpoints: Vec<Endpoint>) -> Self {
        Self::from_target(identity.into(), Target::Direct(endpoints))
    }

    pub fn indirect(identity: impl Into<Identity>, location: impl Into<String>) -> Self {
        Self::from_target(identity.into(), Target::Location(vec![location.into()]))
    }

    pub fn well_known(identity: impl Into<Identity>) -> Self {
        Self::from_target(identity.into(), Target::WellKnown)
    }

    pub fn fixed(identity: impl Into<Identity>, key: ConnectionKey) -> Self {
        Self::from_target(identity.into(), Target::Fixed(key))
    }

    /// True when both handles share one allocation.
    pub fn ptr_eq(a: &Reference, b: &Reference) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub fn identity(&self) -> &Identity {
        &self.0.identity
    }

    pub fn facet(&self) -> &str {
        &self.0.facet
    }

    pub fn protocol(&self) -> Protocol {
        self.0.protocol
    }

    pub fn encoding(&self) -> EncodingVersion {
        self.0.encoding
    }

    pub fn mode(&self) -> InvocationMode {
        self.0.mode
    }

    pub fn target(&self) -> &Target {
        &self.0.target
    }

    pub fn connection_id(&self) -> &str {
        &self.0.connection_id
    }

    pub fn cache_connection(&self) -> bool {
        self.0.cache_connection
    }

    pub fn retry_max_attempts(&self) -> Option<u32> {
        self.0.retry_max_attempts
    }

    /// Per-reference locator cache timeout.
    ///
    /// `None` defers to the communicator; `Some(None)` never expires;
    /// `Some(Some(Duration::ZERO))` bypasses the cache.
    pub fn locator_cache_timeout(&self) -> Option<Option<Duration>> {
        self.0.locator_cache_timeout
    }

    /// Embedded endpoints, empty unless the reference is direct.
    pub fn endpoints(&self) -> &[Endpoint] {
        match &self.0.target {
            Target::Direct(endpoints) => endpoints,
            _ => &[],
        }
    }

    /// Location path, empty unless the reference names an adapter.
    pub fn location(&self) -> &[String] {
        match &self.0.target {
            Target::Location(location) => location,
            _ => &[],
        }
    }

    /// Resolved through a locator rather than carrying endpoints.
    pub fn is_indirect(&self) -> bool {
        matches!(self.0.target, Target::Location(_) | Target::WellKnown)
    }

    pub fn is_well_known(&self) -> bool {
        matches!(self.0.target, Target::WellKnown)
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.0.target, Target::Fixed(_))
    }

    pub fn fixed_connection(&self) -> Option<&ConnectionKey> {
        match &self.0.target {
            Target::Fixed(key) => Some(key),
            _ => None,
        }
    }

    fn modify(&self, f: impl FnOnce(&mut ReferenceData)) -> Reference {
        let mut data = (*self.0).clone();
        f(&mut data);
        if data == *self.0 {
            self.clone()
        } else {
            Reference(Arc::new(data))
        }
    }

    pub fn with_facet(&self, facet: impl Into<String>) -> Reference {
        let facet = facet.into();
        self.modify(|d| d.facet = facet)
    }

    pub fn with_identity(&self, identity: impl Into<Identity>) -> Reference {
        let identity = identity.into();
        self.modify(|d| d.identity = identity)
    }

    pub fn with_protocol(&self, protocol: Protocol) -> Reference {
        self.modify(|d| d.protocol = protocol)
    }

    pub fn with_encoding(&self, encoding: EncodingVersion) -> Reference {
        self.modify(|d| d.encoding = encoding)
    }

    pub fn with_mode(&self, mode: InvocationMode) -> Reference {
        self.modify(|d| d.mode = mode)
    }

    pub fn with_endpoints(&self, endpoints: Vec<Endpoint>) -> Reference {
        self.modify(|d| d.target = Target::Direct(endpoints))
    }

    pub fn with_location(&self, location: Vec<String>) -> Reference {
        self.modify(|d| {
            d.target = if location.is_empty() {
                Target::WellKnown
            } else {
                Target::Location(location)
            }
        })
    }

    pub fn with_connection_id(&self, connection_id: impl Into<String>) -> Reference {
        let connection_id = connection_id.into();
        self.modify(|d| d.connection_id = connection_id)
    }

    pub fn with_cache_connection(&self, cache_connection: bool) -> Reference {
        self.modify(|d| d.cache_connection = cache_connection)
    }

    pub fn with_retry_max_attempts(&self, attempts: u32) -> Reference {
        self.modify(|d| d.retry_max_attempts = Some(attempts))
    }

    pub fn with_locator_cache_timeout(&self, timeout: Option<Duration>) -> Reference {
        self.modify(|d| d.locator_cache_timeout = Some(timeout))
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        Reference::ptr_eq(self, other) || self.0 == other.0
    }
}

impl Eq for Reference {}

impl std::hash::Hash for Reference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.identity)?;
        if !self.0.facet.is_empty() {
            write!(f, " -f {}", self.0.facet)?;
        }
        match &self.0.target {
            Target::Direct(endpoints) => {
                for endpoint in endpoints {
                    write!(f, ":{}", endpoint)?;
                }
                Ok(())
            }
            Target::Location(location) => write!(f, " @ {}", location.join("/")),
            Target::WellKnown => Ok(()),
            Target::Fixed(key) => write!(f, " (fixed {})", key),
        }
    }
}
