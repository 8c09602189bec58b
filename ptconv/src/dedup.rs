//! Detect and drop tensors that alias the same memory.

use std::collections::HashMap;

use tracing::warn;

use crate::tensor::{DataPtr, TensorMap};

/// Group tensor names by [`DataPtr`] and return the groups holding more than
/// one name.
///
/// Groups come out in order of their first member, and names within a group
/// keep the map's order, so the first name of each group is the one saved
/// earliest in the checkpoint.
pub fn shared_pointers(tensors: &TensorMap) -> Vec<Vec<String>> {
    let mut order: Vec<DataPtr> = Vec::new();
    let mut groups: HashMap<DataPtr, Vec<String>> = HashMap::new();
    for (name, tensor) in tensors.iter() {
        let ptr = tensor.data_ptr();
        groups
            .entry(ptr)
            .or_insert_with(|| {
                order.push(ptr);
                Vec::new()
            })
            .push(name.to_string());
    }
    order
        .into_iter()
        .filter_map(|ptr| groups.remove(&ptr))
        .filter(|names| names.len() > 1)
        .collect()
}

/// Keep the first name of every group and remove the rest from `tensors`.
/// Returns the removed names.
pub fn remove_duplicates(tensors: &mut TensorMap, groups: &[Vec<String>]) -> Vec<String> {
    let mut removed = Vec::new();
    for group in groups {
        let Some((kept, rest)) = group.split_first() else {
            continue;
        };
        for name in rest {
            if tensors.remove(name).is_some() {
                warn!(removed = %name, kept = %kept, "dropping aliased tensor");
                removed.push(name.clone());
            }
        }
    }
    removed
}
