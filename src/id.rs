use std::fmt::{Debug, Display, Formatter};

/// Globally unique identifier of a single client participating in a [crate::Workspace].
///
/// Client IDs are scoped to a [crate::Workspace]: every [crate::Doc] created locally within
/// the same workspace shares the same client ID (it's inherited at construction time), which
/// is why it lives here as a bare alias rather than as a newtype tied to one `Doc`.
pub type ClientID = u64;

/// A logical clock value: the position of an operation within a single client's append-only
/// operation log.
pub type Clock = u32;

/// Unique identifier of a single [crate::Item] (or of a [crate::BlockCell] range starting at it):
/// the pair of the client that created it and its position in that client's clock sequence.
///
/// IDs are monotone per client and totally ordered lexicographically by `(client, clock)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ID {
    pub client: ClientID,
    pub clock: Clock,
}

impl ID {
    #[inline]
    pub const fn new(client: ClientID, clock: Clock) -> Self {
        ID { client, clock }
    }

    /// Returns the ID immediately following this one on the same client's clock.
    #[inline]
    pub fn successor(&self, len: Clock) -> ID {
        ID::new(self.client, self.clock + len)
    }
}

impl Display for ID {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}#{}>", self.client, self.clock)
    }
}

/// A map from client ID to the next free clock value for that client, i.e. the clock at which
/// the next operation originated by that client would be appended. Used both as the
/// `before_state`/`after_state` pair recorded on every [crate::TransactionMut] and as the
/// argument to `encode_diff`-style sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateVector(std::collections::HashMap<ClientID, Clock>);

impl StateVector {
    pub fn new() -> Self {
        StateVector(std::collections::HashMap::new())
    }

    #[inline]
    pub fn get(&self, client: &ClientID) -> Clock {
        self.0.get(client).copied().unwrap_or(0)
    }

    #[inline]
    pub fn set_max(&mut self, client: ClientID, clock: Clock) {
        let e = self.0.entry(client).or_insert(0);
        if *e < clock {
            *e = clock;
        }
    }

    #[inline]
    pub fn set_min(&mut self, client: ClientID, clock: Clock) {
        match self.0.entry(client) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                if *e.get() > clock {
                    e.insert(clock);
                }
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(clock);
            }
        }
    }

    pub fn contains_client(&self, client: &ClientID) -> bool {
        self.0.contains_key(client)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientID, &Clock)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(ClientID, Clock)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (ClientID, Clock)>>(iter: T) -> Self {
        StateVector(iter.into_iter().collect())
    }
}
