use serde::{Deserialize, Serialize};

pub type SyscallId = usize;

/// Kind of a kernel resource (index into [`Target::resources`]).
///
/// [`Target::resources`]: crate::target::Target
pub type ResKind = u32;

/// Shape of one syscall argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    /// Plain integer argument (flags, lengths, offsets, ...).
    Scalar,
    /// Pointer to an opaque in-memory payload.
    Buffer,
    /// Consumes a resource of the given kind.
    ResUse(ResKind),
}

/// Static description of one system call.
#[derive(Debug, Clone)]
pub struct Syscall {
    id: SyscallId,
    nr: u64,
    name: &'static str,
    fields: Vec<Field>,
    ret: Option<ResKind>,
}

impl Syscall {
    pub fn new(
        id: SyscallId,
        nr: u64,
        name: &'static str,
        fields: Vec<Field>,
        ret: Option<ResKind>,
    ) -> Self {
        Self {
            id,
            nr,
            name,
            fields,
            ret,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> SyscallId {
        self.id
    }

    #[inline(always)]
    pub fn nr(&self) -> u64 {
        self.nr
    }

    #[inline(always)]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline(always)]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    #[inline(always)]
    pub fn ret(&self) -> Option<ResKind> {
        self.ret
    }

    /// Resource kinds this call consumes.
    pub fn input_res(&self) -> impl Iterator<Item = ResKind> + '_ {
        self.fields.iter().filter_map(|f| match f {
            Field::ResUse(kind) => Some(*kind),
            _ => None,
        })
    }
}
