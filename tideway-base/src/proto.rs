use serde::{Deserialize, Serialize};

// The kinds of object the protocol can carry. Files are transmitted but
// never refined; they ride along with the revisions that name them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    File,
    Key,
    Revision,
    Cert,
    Epoch,
}

impl ObjectType {
    pub const ALL: [ObjectType; 5] = [
        ObjectType::File,
        ObjectType::Key,
        ObjectType::Revision,
        ObjectType::Cert,
        ObjectType::Epoch,
    ];

    /// The types that get their own refiner, in the order refinement
    /// is kicked off. Epochs go first: nothing else may be committed
    /// until the epoch exchange has settled.
    pub const REFINED: [ObjectType; 4] = [
        ObjectType::Epoch,
        ObjectType::Key,
        ObjectType::Cert,
        ObjectType::Revision,
    ];

    pub fn code(self) -> u8 {
        match self {
            ObjectType::File => 2,
            ObjectType::Key => 3,
            ObjectType::Revision => 4,
            ObjectType::Cert => 5,
            ObjectType::Epoch => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<ObjectType> {
        match code {
            2 => Some(ObjectType::File),
            3 => Some(ObjectType::Key),
            4 => Some(ObjectType::Revision),
            5 => Some(ObjectType::Cert),
            6 => Some(ObjectType::Epoch),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectType::File => "file",
            ObjectType::Key => "key",
            ObjectType::Revision => "revision",
            ObjectType::Cert => "cert",
            ObjectType::Epoch => "epoch",
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// A peer plays source (sender), sink (receiver), or both. The wire field
// names the role the client wishes to play; the server then assumes the
// (possibly degraded) opposite role.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Role {
    Source,
    Sink,
    SourceAndSink,
}

impl Role {
    pub fn code(self) -> u8 {
        match self {
            Role::Source => 1,
            Role::Sink => 2,
            Role::SourceAndSink => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Role> {
        match code {
            1 => Some(Role::Source),
            2 => Some(Role::Sink),
            3 => Some(Role::SourceAndSink),
            _ => None,
        }
    }

    pub fn can_send(self) -> bool {
        matches!(self, Role::Source | Role::SourceAndSink)
    }

    pub fn can_receive(self) -> bool {
        matches!(self, Role::Sink | Role::SourceAndSink)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::Source => "source",
            Role::Sink => "sink",
            Role::SourceAndSink => "source and sink",
        })
    }
}

/// Which side of the conversation we are. The server speaks first
/// (hello); the client decides first that refinement is over (done).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Voice {
    Client,
    Server,
}

/// The two sub-kinds of refine traffic. A query may provoke further
/// queries; a response never does.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RefineKind {
    Query,
    Response,
}

impl RefineKind {
    pub fn code(self) -> u8 {
        match self {
            RefineKind::Query => 0,
            RefineKind::Response => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<RefineKind> {
        match code {
            0 => Some(RefineKind::Query),
            1 => Some(RefineKind::Response),
            _ => None,
        }
    }
}
