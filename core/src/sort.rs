//! Sorting and cursor filtering for the result pipeline.
//!
//! Sort is stable by repeated key comparison over the collation order;
//! missing values sort as MIN and ties fall through to the entity id. The
//! after-cursor filter is a one-pass stateful predicate over the sorted
//! stream.

use std::cmp::Ordering;

use trellis_query::{After, Cursor, OrderBy, OrderDirection};

use crate::{collation, entity::EntityView};

/// Total order over entities for the given order keys: each key in turn,
/// direction applied, entity id as the final tiebreaker.
pub fn compare_entities(a: &EntityView, b: &EntityView, order: &[OrderBy]) -> Ordering {
    for item in order {
        let va = a.get(&item.path);
        let vb = b.get(&item.path);
        let mut cmp = collation::compare_optional(va.as_ref(), vb.as_ref());
        if item.direction == OrderDirection::Desc {
            cmp = cmp.reverse();
        }
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    a.id().cmp(b.id())
}

pub fn sort_by_order<T>(items: &mut [T], order: &[OrderBy], view: impl Fn(&T) -> &EntityView) {
    items.sort_by(|a, b| compare_entities(view(a), view(b), order));
}

/// Point check: does this entity sit strictly after (or at, when inclusive)
/// the cursor under the effective sort? Used for single-entity membership
/// tests in incremental maintenance, where no ordered stream exists.
pub fn is_after_cursor(view: &EntityView, after: &After, order: &[OrderBy]) -> bool {
    let position = match order.first() {
        Some(primary) => {
            let value = view.get(&primary.path);
            let cmp = collation::compare_optional(value.as_ref(), Some(&after.cursor.value));
            match primary.direction {
                OrderDirection::Asc => cmp,
                OrderDirection::Desc => cmp.reverse(),
            }
        }
        None => view.id().cmp(&after.cursor.entity_id),
    };
    match position {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => {
            if view.id() == &after.cursor.entity_id {
                after.inclusive
            } else {
                view.id() > &after.cursor.entity_id
            }
        }
    }
}

/// One-pass `after` predicate, applied when the cursor was not absorbed into
/// the index walk. Tracks whether the cursor's value has been reached, its
/// entity id reached, and its value passed; elements pass once either
/// (value-reached AND id-reached, gated by `inclusive`) or value-passed.
#[derive(Debug)]
pub struct AfterGate {
    cursor: Cursor,
    inclusive: bool,
    primary: Option<OrderBy>,
    value_reached: bool,
    id_reached: bool,
    value_passed: bool,
}

impl AfterGate {
    pub fn new(after: &After, order: &[OrderBy]) -> Self {
        Self {
            cursor: after.cursor.clone(),
            inclusive: after.inclusive,
            primary: order.first().cloned(),
            value_reached: false,
            id_reached: false,
            value_passed: false,
        }
    }

    pub fn admit(&mut self, view: &EntityView) -> bool {
        if self.value_passed {
            return true;
        }
        let position = match &self.primary {
            Some(order) => {
                let value = view.get(&order.path);
                let cmp = collation::compare_optional(value.as_ref(), Some(&self.cursor.value));
                match order.direction {
                    OrderDirection::Asc => cmp,
                    OrderDirection::Desc => cmp.reverse(),
                }
            }
            // no order keys: the effective sort is the entity id itself
            None => view.id().cmp(&self.cursor.entity_id),
        };
        match position {
            Ordering::Greater => {
                self.value_passed = true;
                true
            }
            Ordering::Less => false,
            Ordering::Equal => {
                self.value_reached = true;
                if view.id() == &self.cursor.entity_id {
                    self.id_reached = true;
                    self.inclusive
                } else {
                    // ties sharing the cursor value pass only once the
                    // cursor's own entity has gone by
                    self.id_reached
                }
            }
        }
    }
}
