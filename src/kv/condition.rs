use crate::models::{EtcdError, Node};

/// A test against the previous live node that decides whether a mutation
/// applies, and what the resulting action is called on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Accepts any prior state.
    Always,
    /// Requires the node to exist (`true`) or be absent (`false`).
    PrevExist(bool),
    /// Requires existence and a matching value.
    PrevValue(String),
    /// Requires existence and a matching modifiedIndex.
    PrevIndex(i64),
}

impl Condition {
    /// Checks the condition against the prior node. `index` is the index
    /// reported in any resulting error: the global index *before* this
    /// mutation's increment.
    pub fn check(&self, key: &str, index: i64, node: Option<&Node>) -> Result<(), EtcdError> {
        match self {
            Condition::Always => Ok(()),
            Condition::PrevExist(expected) => match (node, expected) {
                (None, true) => Err(EtcdError::not_found(key, index)),
                (Some(_), false) => Err(EtcdError::key_exists(key, index)),
                _ => Ok(()),
            },
            Condition::PrevValue(expected) => match node {
                None => Err(EtcdError::not_found(key, index)),
                Some(node) if node.value != *expected => {
                    Err(EtcdError::compare_failed(expected, &node.value, index))
                }
                Some(_) => Ok(()),
            },
            Condition::PrevIndex(expected) => match node {
                None => Err(EtcdError::not_found(key, index)),
                Some(node) if node.modified_index != *expected => {
                    Err(EtcdError::compare_failed(expected, node.modified_index, index))
                }
                Some(_) => Ok(()),
            },
        }
    }

    /// The action name recorded and returned when this condition guards a
    /// set-type operation.
    pub fn set_action_name(&self) -> &'static str {
        match self {
            Condition::Always => "set",
            Condition::PrevExist(true) => "update",
            Condition::PrevExist(false) => "create",
            Condition::PrevValue(_) | Condition::PrevIndex(_) => "compareAndSwap",
        }
    }

    /// The action name for a delete-type operation.
    pub fn delete_action_name(&self) -> &'static str {
        match self {
            Condition::Always | Condition::PrevExist(_) => "delete",
            Condition::PrevValue(_) | Condition::PrevIndex(_) => "compareAndDelete",
        }
    }
}
