//! Operations delivered to the remote.

use crate::entity::EntityKind;
use crate::id::EntityId;
use crate::money::Money;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type tag of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Open a tab.
    CreateSession,
    /// Close a tab.
    CloseSession,
    /// Create an order.
    CreateOrder,
    /// Add a line to an order.
    AddOrderItem,
    /// Reduce or remove a line.
    ModifyOrderItem,
    /// Confirm an order.
    ConfirmOrder,
    /// Void an order.
    VoidOrder,
}

impl OperationType {
    /// Returns the remote operation name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::CreateSession => "createSession",
            OperationType::CloseSession => "closeSession",
            OperationType::CreateOrder => "createOrder",
            OperationType::AddOrderItem => "addOrderItem",
            OperationType::ModifyOrderItem => "modifyOrderItem",
            OperationType::ConfirmOrder => "confirmOrder",
            OperationType::VoidOrder => "voidOrder",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local change that must reach the remote.
///
/// Ids inside an operation are the ids known when it was enqueued; the sync
/// worker rewrites temporary ids to canonical ones right before sending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Open a tab.
    CreateSession {
        /// Client id of the new tab.
        session_id: EntityId,
        /// Table label.
        table: Option<String>,
    },
    /// Close a tab.
    CloseSession {
        /// Tab to close.
        session_id: EntityId,
    },
    /// Create an order.
    CreateOrder {
        /// Client id of the new order.
        order_id: EntityId,
        /// Owning tab.
        session_id: Option<EntityId>,
    },
    /// Add a line to an order.
    AddOrderItem {
        /// Target order.
        order_id: EntityId,
        /// Client id of the new line.
        item_id: EntityId,
        /// Product identifier.
        product_id: String,
        /// Units.
        quantity: u32,
        /// Price per unit.
        unit_price: Money,
    },
    /// Reduce a line; quantity zero removes it.
    ModifyOrderItem {
        /// Owning order.
        order_id: EntityId,
        /// Target line.
        item_id: EntityId,
        /// New quantity.
        new_quantity: u32,
    },
    /// Confirm an order.
    ConfirmOrder {
        /// Target order.
        order_id: EntityId,
    },
    /// Void an order.
    VoidOrder {
        /// Target order.
        order_id: EntityId,
    },
}

impl Operation {
    /// Returns the type tag.
    pub fn op_type(&self) -> OperationType {
        match self {
            Operation::CreateSession { .. } => OperationType::CreateSession,
            Operation::CloseSession { .. } => OperationType::CloseSession,
            Operation::CreateOrder { .. } => OperationType::CreateOrder,
            Operation::AddOrderItem { .. } => OperationType::AddOrderItem,
            Operation::ModifyOrderItem { .. } => OperationType::ModifyOrderItem,
            Operation::ConfirmOrder { .. } => OperationType::ConfirmOrder,
            Operation::VoidOrder { .. } => OperationType::VoidOrder,
        }
    }

    /// Returns the entity this operation creates, if any.
    pub fn created_entity(&self) -> Option<(EntityKind, &EntityId)> {
        match self {
            Operation::CreateSession { session_id, .. } => Some((EntityKind::Session, session_id)),
            Operation::CreateOrder { order_id, .. } => Some((EntityKind::Order, order_id)),
            Operation::AddOrderItem { item_id, .. } => Some((EntityKind::LineItem, item_id)),
            _ => None,
        }
    }

    /// Returns every entity id the operation references.
    pub fn touches(&self) -> Vec<&EntityId> {
        match self {
            Operation::CreateSession { session_id, .. } | Operation::CloseSession { session_id } => {
                vec![session_id]
            }
            Operation::CreateOrder {
                order_id,
                session_id,
            } => std::iter::once(order_id).chain(session_id.as_ref()).collect(),
            Operation::AddOrderItem {
                order_id, item_id, ..
            }
            | Operation::ModifyOrderItem {
                order_id, item_id, ..
            } => vec![order_id, item_id],
            Operation::ConfirmOrder { order_id } | Operation::VoidOrder { order_id } => {
                vec![order_id]
            }
        }
    }

    /// Returns true if the operation changes order contents or order state,
    /// i.e. it becomes irrelevant once the owning tab is closed.
    pub fn is_tab_content(&self) -> bool {
        !matches!(
            self,
            Operation::CreateSession { .. } | Operation::CloseSession { .. }
        )
    }

    /// Returns a copy with every id passed through `map`.
    #[must_use]
    pub fn map_ids(&self, map: impl Fn(&EntityId) -> EntityId) -> Operation {
        match self {
            Operation::CreateSession { session_id, table } => Operation::CreateSession {
                session_id: map(session_id),
                table: table.clone(),
            },
            Operation::CloseSession { session_id } => Operation::CloseSession {
                session_id: map(session_id),
            },
            Operation::CreateOrder {
                order_id,
                session_id,
            } => Operation::CreateOrder {
                order_id: map(order_id),
                session_id: session_id.as_ref().map(&map),
            },
            Operation::AddOrderItem {
                order_id,
                item_id,
                product_id,
                quantity,
                unit_price,
            } => Operation::AddOrderItem {
                order_id: map(order_id),
                item_id: map(item_id),
                product_id: product_id.clone(),
                quantity: *quantity,
                unit_price: *unit_price,
            },
            Operation::ModifyOrderItem {
                order_id,
                item_id,
                new_quantity,
            } => Operation::ModifyOrderItem {
                order_id: map(order_id),
                item_id: map(item_id),
                new_quantity: *new_quantity,
            },
            Operation::ConfirmOrder { order_id } => Operation::ConfirmOrder {
                order_id: map(order_id),
            },
            Operation::VoidOrder { order_id } => Operation::VoidOrder {
                order_id: map(order_id),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creations_name_their_entity() {
        let order_id = EntityId::temporary();
        let op = Operation::CreateOrder {
            order_id: order_id.clone(),
            session_id: None,
        };
        assert_eq!(op.created_entity(), Some((EntityKind::Order, &order_id)));
        assert!(Operation::ConfirmOrder { order_id }.created_entity().is_none());
    }

    #[test]
    fn map_ids_rewrites_every_reference() {
        let tmp_order = EntityId::temporary();
        let tmp_item = EntityId::temporary();
        let op = Operation::ModifyOrderItem {
            order_id: tmp_order.clone(),
            item_id: tmp_item.clone(),
            new_quantity: 1,
        };

        let mapped = op.map_ids(|id| {
            if id == &tmp_order {
                EntityId::canonical("O-1")
            } else {
                id.clone()
            }
        });

        assert_eq!(
            mapped.touches(),
            vec![&EntityId::canonical("O-1"), &tmp_item]
        );
        assert_eq!(mapped.op_type(), OperationType::ModifyOrderItem);
    }

    #[test]
    fn create_order_touches_session() {
        let session = EntityId::canonical("S-1");
        let op = Operation::CreateOrder {
            order_id: EntityId::temporary(),
            session_id: Some(session.clone()),
        };
        assert!(op.touches().contains(&&session));
        assert!(op.is_tab_content());
        assert!(!Operation::CloseSession { session_id: session }.is_tab_content());
    }
}
