//! Message-type declarations: ordered lists of table and chunk components.
//!
//! Types are never sent over the wire. Every process must declare the same
//! types with the same components in the same order before using them; the
//! receiver trusts its own registry to interpret an incoming buffer.

use crate::ddd_error::DddError;

/// Maximum number of components per message type.
pub const MAX_COMPONENTS: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MsgTypeId(usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(usize);

impl ComponentId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ComponentKind {
    /// Homogeneous records of a fixed stride; the entry count varies per message.
    Table { stride: usize },
    /// Opaque bytes; the size varies per message.
    Chunk,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentDesc {
    pub name: String,
    pub kind: ComponentKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MsgType {
    name: String,
    components: Vec<ComponentDesc>,
}

impl MsgType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn components(&self) -> &[ComponentDesc] {
        &self.components
    }

    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    pub(crate) fn component(&self, c: ComponentId) -> Result<&ComponentDesc, DddError> {
        self.components.get(c.0).ok_or_else(|| DddError::BadComponent {
            component: c.0,
            expected: "component",
            type_name: self.name.clone(),
        })
    }

    /// Stride of a table component.
    pub(crate) fn stride(&self, c: ComponentId) -> Result<usize, DddError> {
        match self.component(c)?.kind {
            ComponentKind::Table { stride } => Ok(stride),
            ComponentKind::Chunk => Err(DddError::BadComponent {
                component: c.0,
                expected: "table",
                type_name: self.name.clone(),
            }),
        }
    }

    pub(crate) fn expect_chunk(&self, c: ComponentId) -> Result<(), DddError> {
        match self.component(c)?.kind {
            ComponentKind::Chunk => Ok(()),
            ComponentKind::Table { .. } => Err(DddError::BadComponent {
                component: c.0,
                expected: "chunk",
                type_name: self.name.clone(),
            }),
        }
    }

    fn push(&mut self, name: &str, kind: ComponentKind) -> Result<ComponentId, DddError> {
        if self.components.len() >= MAX_COMPONENTS {
            return Err(DddError::TooManyComponents {
                type_name: self.name.clone(),
                max: MAX_COMPONENTS,
            });
        }
        self.components.push(ComponentDesc {
            name: name.to_owned(),
            kind,
        });
        Ok(ComponentId(self.components.len() - 1))
    }
}

/// Per-process registry of declared message types.
#[derive(Clone, Debug, Default)]
pub struct MsgTypeRegistry {
    types: Vec<MsgType>,
}

impl MsgTypeRegistry {
    pub fn declare(&mut self, name: &str) -> MsgTypeId {
        self.types.push(MsgType {
            name: name.to_owned(),
            components: Vec::new(),
        });
        MsgTypeId(self.types.len() - 1)
    }

    pub fn add_table(
        &mut self,
        t: MsgTypeId,
        name: &str,
        stride: usize,
    ) -> Result<ComponentId, DddError> {
        self.get_mut(t)?.push(name, ComponentKind::Table { stride })
    }

    pub fn add_chunk(&mut self, t: MsgTypeId, name: &str) -> Result<ComponentId, DddError> {
        self.get_mut(t)?.push(name, ComponentKind::Chunk)
    }

    pub fn get(&self, t: MsgTypeId) -> Result<&MsgType, DddError> {
        self.types
            .get(t.0)
            .ok_or(DddError::UnknownHandle { kind: "message type" })
    }

    fn get_mut(&mut self, t: MsgTypeId) -> Result<&mut MsgType, DddError> {
        self.types
            .get_mut(t.0)
            .ok_or(DddError::UnknownHandle { kind: "message type" })
    }
}
