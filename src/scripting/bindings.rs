/// `scripting/bindings.rs` - binding slots and their chosen identifiers.
///
/// Each script can expose up to five logical slots under names of its own
/// choosing. An empty identifier disables the slot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingSlot {
    /// The calling context (the object the script was acquired through).
    Context,
    /// The folder that physically holds the script.
    Container,
    /// The script itself.
    Script,
    /// Free-form namespace handed in by the caller.
    Namespace,
    /// Unconsumed path segments after the script in the request path.
    Subpath,
}

impl BindingSlot {
    pub const ALL: [BindingSlot; 5] = [
        BindingSlot::Context,
        BindingSlot::Container,
        BindingSlot::Script,
        BindingSlot::Namespace,
        BindingSlot::Subpath,
    ];

    /// Name used in `##bind <name>=` directives.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Container => "container",
            Self::Script => "script",
            Self::Namespace => "namespace",
            Self::Subpath => "subpath",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|slot| slot.as_str() == name)
    }

    fn default_identifier(&self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Container => "container",
            Self::Script => "script",
            Self::Namespace => "",
            Self::Subpath => "traverse_subpath",
        }
    }
}

/// Ids no script may take, since every default binding uses them.
pub const RESERVED_IDS: [&str; 4] = ["context", "container", "script", "traverse_subpath"];

pub fn is_reserved_id(id: &str) -> bool {
    RESERVED_IDS.contains(&id)
}

/// Slot-to-identifier map, ordered by slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingAssignments {
    assignments: BTreeMap<BindingSlot, String>,
}

impl Default for BindingAssignments {
    fn default() -> Self {
        Self {
            assignments: BindingSlot::ALL
                .into_iter()
                .map(|slot| (slot, slot.default_identifier().to_string()))
                .collect(),
        }
    }
}

impl BindingAssignments {
    /// All slots disabled.
    pub fn none() -> Self {
        Self {
            assignments: BindingSlot::ALL
                .into_iter()
                .map(|slot| (slot, String::new()))
                .collect(),
        }
    }

    /// Identifier assigned to `slot`, `None` when disabled.
    pub fn name_for(&self, slot: BindingSlot) -> Option<&str> {
        self.assignments
            .get(&slot)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Assign `identifier` to `slot`; an empty identifier disables it.
    pub fn assign(&mut self, slot: BindingSlot, identifier: &str) {
        self.assignments.insert(slot, identifier.trim().to_string());
    }

    /// Rendered value of a slot, `""` when disabled.
    pub fn rendered(&self, slot: BindingSlot) -> &str {
        self.name_for(slot).unwrap_or("")
    }

    /// Active identifiers in slot order; these become globals of the body.
    pub fn assigned_names_in_order(&self) -> Vec<String> {
        BindingSlot::ALL
            .into_iter()
            .filter_map(|slot| self.name_for(slot).map(str::to_string))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BindingSlot, &str)> {
        BindingSlot::ALL
            .into_iter()
            .map(move |slot| (slot, self.rendered(slot)))
    }
}
