use std::fmt::Debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Read-only; served by the chain tail.
    Accessor,
    /// State-changing; enters at the chain head and propagates down.
    Mutator,
}

/// An opcode vocabulary for one data structure.
pub trait CommandSet: Copy + Debug + Send + Sync + 'static {
    fn code(self) -> i32;
    fn kind(self) -> CommandKind;
    fn name(self) -> &'static str;

    fn is_mutator(self) -> bool {
        self.kind() == CommandKind::Mutator
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashTableOp {
    Exists,
    Get,
    NumKeys,
    Put,
    Remove,
    Update,
    Upsert,
    Lock,
    Unlock,
    LockedGet,
    LockedPut,
    LockedRemove,
    LockedUpdate,
    LockedUpsert,
}

impl HashTableOp {
    pub const ALL: [HashTableOp; 14] = [
        HashTableOp::Exists,
        HashTableOp::Get,
        HashTableOp::NumKeys,
        HashTableOp::Put,
        HashTableOp::Remove,
        HashTableOp::Update,
        HashTableOp::Upsert,
        HashTableOp::Lock,
        HashTableOp::Unlock,
        HashTableOp::LockedGet,
        HashTableOp::LockedPut,
        HashTableOp::LockedRemove,
        HashTableOp::LockedUpdate,
        HashTableOp::LockedUpsert,
    ];

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.code() == code)
    }

    /// Locked-mode counterpart used while a `LockedSession` is open.
    pub fn locked(self) -> Self {
        match self {
            HashTableOp::Get => HashTableOp::LockedGet,
            HashTableOp::Put => HashTableOp::LockedPut,
            HashTableOp::Remove => HashTableOp::LockedRemove,
            HashTableOp::Update => HashTableOp::LockedUpdate,
            HashTableOp::Upsert => HashTableOp::LockedUpsert,
            other => other,
        }
    }

    /// Number of arguments one logical operation contributes to a batch.
    pub fn args_per_op(self) -> usize {
        match self {
            HashTableOp::Put
            | HashTableOp::Update
            | HashTableOp::Upsert
            | HashTableOp::LockedPut
            | HashTableOp::LockedUpdate
            | HashTableOp::LockedUpsert => 2,
            HashTableOp::NumKeys | HashTableOp::Lock | HashTableOp::Unlock => 0,
            _ => 1,
        }
    }
}

impl CommandSet for HashTableOp {
    fn code(self) -> i32 {
        match self {
            HashTableOp::Exists => 0,
            HashTableOp::Get => 1,
            HashTableOp::NumKeys => 2,
            HashTableOp::Put => 3,
            HashTableOp::Remove => 4,
            HashTableOp::Update => 5,
            HashTableOp::Upsert => 6,
            HashTableOp::Lock => 7,
            HashTableOp::Unlock => 8,
            HashTableOp::LockedGet => 9,
            HashTableOp::LockedPut => 10,
            HashTableOp::LockedRemove => 11,
            HashTableOp::LockedUpdate => 12,
            HashTableOp::LockedUpsert => 13,
        }
    }

    fn kind(self) -> CommandKind {
        match self {
            HashTableOp::Exists
            | HashTableOp::Get
            | HashTableOp::NumKeys
            | HashTableOp::LockedGet => CommandKind::Accessor,
            _ => CommandKind::Mutator,
        }
    }

    fn name(self) -> &'static str {
        match self {
            HashTableOp::Exists => "exists",
            HashTableOp::Get => "get",
            HashTableOp::NumKeys => "num_keys",
            HashTableOp::Put => "put",
            HashTableOp::Remove => "remove",
            HashTableOp::Update => "update",
            HashTableOp::Upsert => "upsert",
            HashTableOp::Lock => "lock",
            HashTableOp::Unlock => "unlock",
            HashTableOp::LockedGet => "locked_get",
            HashTableOp::LockedPut => "locked_put",
            HashTableOp::LockedRemove => "locked_remove",
            HashTableOp::LockedUpdate => "locked_update",
            HashTableOp::LockedUpsert => "locked_upsert",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileOp {
    Write,
    Read,
    Seek,
}

impl FileOp {
    pub fn from_code(code: i32) -> Option<Self> {
        [FileOp::Write, FileOp::Read, FileOp::Seek]
            .into_iter()
            .find(|op| op.code() == code)
    }
}

// File opcodes live in their own range so a misrouted command is rejected
// rather than reinterpreted as a hash-table op.
impl CommandSet for FileOp {
    fn code(self) -> i32 {
        match self {
            FileOp::Write => 100,
            FileOp::Read => 101,
            FileOp::Seek => 102,
        }
    }

    fn kind(self) -> CommandKind {
        match self {
            FileOp::Write => CommandKind::Mutator,
            FileOp::Read | FileOp::Seek => CommandKind::Accessor,
        }
    }

    fn name(self) -> &'static str {
        match self {
            FileOp::Write => "write",
            FileOp::Read => "read",
            FileOp::Seek => "seek",
        }
    }
}
