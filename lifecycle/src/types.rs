//! Session documents and the requests that mutate them.

use commonware_utils::{from_hex_formatted, hex};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    collections::BTreeSet,
    fmt,
    str::FromStr,
    time::SystemTime,
};
use thiserror::Error;

/// Define an opaque, string-backed identifier.
macro_rules! identifier {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

identifier!(
    /// Identifier of a [Session].
    SessionId
);
identifier!(
    /// Identifier of a votable choice (candidate, option, or participant).
    ChoiceId
);
identifier!(
    /// Identifier of an [EditRequest] or [CandidateRequest].
    RequestId
);
identifier!(
    /// Identity of a user (proposer of an edit, nominee of an election).
    Identity
);

/// Length of a ledger contract address.
pub const ADDRESS_LENGTH: usize = 20;

/// Errors that can occur when parsing an [Address].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid hex")]
    InvalidHex,
    #[error("invalid length: {0}")]
    InvalidLength(usize),
}

/// Address of a contract deployed on the ledger.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_LENGTH]);

impl Address {
    pub const fn new(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex(&self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = from_hex_formatted(s).ok_or(AddressError::InvalidHex)?;
        let bytes: [u8; ADDRESS_LENGTH] = bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| AddressError::InvalidLength(bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// The kind of a [Session].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Poll,
    Election,
    Tournament,
}

/// How many choices a voter selects, and whether they are ordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Single,
    Multiple,
    Ranked,
}

/// A closed time range.
///
/// For an election this is the nomination window. For a poll it is the intended voting window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: SystemTime,
    pub end: SystemTime,
}

impl Window {
    /// Returns a window if `end` does not precede `start`.
    pub fn new(start: SystemTime, end: SystemTime) -> Option<Self> {
        (end >= start).then_some(Self { start, end })
    }

    /// Windows read back from storage are not guaranteed to be ordered.
    pub fn is_ordered(&self) -> bool {
        self.end >= self.start
    }

    pub fn contains(&self, at: SystemTime) -> bool {
        self.start <= at && at <= self.end
    }
}

/// Timestamps that drive the status of a [Session].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub created_at: SystemTime,
    pub window: Option<Window>,
    pub started_at: Option<SystemTime>,
    pub ended_at: Option<SystemTime>,
}

impl Lifecycle {
    pub fn new(created_at: SystemTime) -> Self {
        Self {
            created_at,
            window: None,
            started_at: None,
            ended_at: None,
        }
    }
}

/// Poll option or tournament participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub id: ChoiceId,
    pub name: String,
    pub votes: u64,
}

impl Choice {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ChoiceId::new(id),
            name: name.into(),
            votes: 0,
        }
    }
}

/// Public profile submitted with a nomination.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub full_name: String,
    pub party: String,
    pub biography: String,
    pub promises: Vec<String>,
}

/// Election candidate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: ChoiceId,
    pub identity: Identity,
    pub profile: Profile,
    pub votes: u64,
}

/// Kind-specific roster of a [Session].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ballot {
    Poll { options: Vec<Choice> },
    Election { candidates: Vec<Candidate> },
    Tournament { participants: Vec<Choice> },
}

impl Ballot {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Poll { .. } => Kind::Poll,
            Self::Election { .. } => Kind::Election,
            Self::Tournament { .. } => Kind::Tournament,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Poll { options } => options.len(),
            Self::Election { candidates } => candidates.len(),
            Self::Tournament { participants } => participants.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the choice identifiers and locally tracked counts, in roster order.
    pub fn counts(&self) -> Vec<(&ChoiceId, u64)> {
        match self {
            Self::Poll { options: choices } | Self::Tournament { participants: choices } => {
                choices.iter().map(|c| (&c.id, c.votes)).collect()
            }
            Self::Election { candidates } => candidates.iter().map(|c| (&c.id, c.votes)).collect(),
        }
    }

    /// Returns the choice identifiers, in roster order.
    pub fn ids(&self) -> Vec<ChoiceId> {
        self.counts().into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn contains(&self, id: &ChoiceId) -> bool {
        self.counts().iter().any(|(existing, _)| *existing == id)
    }

    /// Returns the locally tracked count of a choice.
    pub fn votes(&self, id: &ChoiceId) -> Option<u64> {
        self.counts()
            .into_iter()
            .find_map(|(existing, votes)| (existing == id).then_some(votes))
    }

    /// Overwrite the count of a choice, returning false if it is not on the roster.
    pub(crate) fn set_votes(&mut self, id: &ChoiceId, votes: u64) -> bool {
        let slot = match self {
            Self::Poll { options: choices } | Self::Tournament { participants: choices } => {
                choices.iter_mut().find(|c| &c.id == id).map(|c| &mut c.votes)
            }
            Self::Election { candidates } => candidates
                .iter_mut()
                .find(|c| &c.id == id)
                .map(|c| &mut c.votes),
        };
        match slot {
            Some(slot) => {
                *slot = votes;
                true
            }
            None => false,
        }
    }

    /// Append a poll option or tournament participant.
    ///
    /// Returns false for elections (candidates are admitted) or if the id is taken.
    pub(crate) fn add_choice(&mut self, choice: Choice) -> bool {
        match self {
            Self::Poll { options: choices } | Self::Tournament { participants: choices } => {
                if choices.iter().any(|c| c.id == choice.id) {
                    return false;
                }
                choices.push(choice);
                true
            }
            Self::Election { .. } => false,
        }
    }

    /// Append a candidate unless one with the same identity is already present.
    pub(crate) fn admit(&mut self, candidate: Candidate) -> bool {
        match self {
            Self::Election { candidates } => {
                if candidates.iter().any(|c| c.identity == candidate.identity) {
                    return false;
                }
                candidates.push(candidate);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn remove(&mut self, id: &ChoiceId) -> bool {
        match self {
            Self::Poll { options: choices } | Self::Tournament { participants: choices } => {
                let before = choices.len();
                choices.retain(|c| &c.id != id);
                choices.len() != before
            }
            Self::Election { candidates } => {
                let before = candidates.len();
                candidates.retain(|c| &c.id != id);
                candidates.len() != before
            }
        }
    }
}

/// How voters prove eligibility.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    #[default]
    Open,
    Kyc,
    Phrase,
}

/// When results become visible to voters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    RealTime,
    AfterEnd,
}

/// Who may discover and join the session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    #[default]
    Public,
    Private,
}

/// Settings whose changes are governed once a session is live.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub verification: Verification,
    pub visibility: Visibility,
    pub secret_phrase: Option<String>,
    pub access: Access,
}

/// Metadata of the last successful tally read from the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub synced_at: SystemTime,
    pub voters: u64,
    pub block: u64,
}

/// A voting session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub description: String,
    pub organization: String,
    pub ballot: Ballot,
    pub mode: Mode,
    pub lifecycle: Option<Lifecycle>,
    pub contract: Option<Address>,
    pub tally: Option<Tally>,
    pub settings: Settings,

    /// Whether team members (not only leaders) may apply governed edits directly.
    pub direct_edit: bool,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        ballot: Ballot,
        mode: Mode,
        created_at: SystemTime,
    ) -> Self {
        Self {
            id: SessionId::new(id),
            name: name.into(),
            description: String::new(),
            organization: String::new(),
            ballot,
            mode,
            lifecycle: Some(Lifecycle::new(created_at)),
            contract: None,
            tally: None,
            settings: Settings::default(),
            direct_edit: false,
        }
    }

    pub fn kind(&self) -> Kind {
        self.ballot.kind()
    }

    pub fn window(&self) -> Option<&Window> {
        self.lifecycle.as_ref().and_then(|l| l.window.as_ref())
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.lifecycle.as_ref().and_then(|l| l.started_at)
    }

    pub fn ended_at(&self) -> Option<SystemTime> {
        self.lifecycle.as_ref().and_then(|l| l.ended_at)
    }
}

/// A session field that can be changed through a [Patch].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Description,
    Organization,
    Window,
    Mode,
    Roster,
    Verification,
    Visibility,
    SecretPhrase,
    Access,
}

/// A change to the roster requested through a [Patch].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RosterChange {
    Add(Choice),
    Remove(ChoiceId),
}

/// A sparse update to the editable fields of a [Session].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub organization: Option<String>,
    pub window: Option<Window>,
    pub mode: Option<Mode>,
    pub roster: Vec<RosterChange>,
    pub verification: Option<Verification>,
    pub visibility: Option<Visibility>,
    pub secret_phrase: Option<String>,
    pub access: Option<Access>,
}

impl Patch {
    /// Returns the set of fields touched by this patch.
    pub fn fields(&self) -> BTreeSet<Field> {
        let mut fields = BTreeSet::new();
        let touched = [
            (self.name.is_some(), Field::Name),
            (self.description.is_some(), Field::Description),
            (self.organization.is_some(), Field::Organization),
            (self.window.is_some(), Field::Window),
            (self.mode.is_some(), Field::Mode),
            (!self.roster.is_empty(), Field::Roster),
            (self.verification.is_some(), Field::Verification),
            (self.visibility.is_some(), Field::Visibility),
            (self.secret_phrase.is_some(), Field::SecretPhrase),
            (self.access.is_some(), Field::Access),
        ];
        for (set, field) in touched {
            if set {
                fields.insert(field);
            }
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Apply the patch to a session document.
    ///
    /// A window patched onto a session without a lifecycle creates one at `now`.
    pub(crate) fn apply(self, session: &mut Session, now: SystemTime) {
        if let Some(name) = self.name {
            session.name = name;
        }
        if let Some(description) = self.description {
            session.description = description;
        }
        if let Some(organization) = self.organization {
            session.organization = organization;
        }
        if let Some(window) = self.window {
            session
                .lifecycle
                .get_or_insert_with(|| Lifecycle::new(now))
                .window = Some(window);
        }
        if let Some(mode) = self.mode {
            session.mode = mode;
        }
        for change in self.roster {
            match change {
                RosterChange::Add(choice) => {
                    session.ballot.add_choice(choice);
                }
                RosterChange::Remove(id) => {
                    session.ballot.remove(&id);
                }
            }
        }
        if let Some(verification) = self.verification {
            session.settings.verification = verification;
        }
        if let Some(visibility) = self.visibility {
            session.settings.visibility = visibility;
        }
        if let Some(secret_phrase) = self.secret_phrase {
            session.settings.secret_phrase = Some(secret_phrase);
        }
        if let Some(access) = self.access {
            session.settings.access = access;
        }
    }
}

/// Resolution of an [EditRequest].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditStatus {
    Pending,
    Approved,
    Rejected,
}

/// A [Patch] awaiting approval.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRequest {
    pub id: RequestId,
    pub session: SessionId,
    pub proposed_by: Identity,
    pub patch: Patch,
    pub status: EditStatus,
    pub created_at: SystemTime,
}

/// Resolution of a [CandidateRequest].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionStatus {
    Pending,
    Accepted,
    Refused,
}

/// A nomination submitted during an election's nomination window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRequest {
    pub id: RequestId,
    pub session: SessionId,
    pub identity: Identity,
    pub profile: Profile,
    pub status: AdmissionStatus,
    pub requested_at: SystemTime,
}

impl CandidateRequest {
    /// Whether this request blocks another nomination by the same identity.
    pub fn is_open(&self) -> bool {
        matches!(
            self.status,
            AdmissionStatus::Pending | AdmissionStatus::Accepted
        )
    }

    /// The roster entry created when this request is accepted.
    pub fn candidate(&self) -> Candidate {
        Candidate {
            id: ChoiceId::new(self.id.as_str()),
            identity: self.identity.clone(),
            profile: self.profile.clone(),
            votes: 0,
        }
    }
}
