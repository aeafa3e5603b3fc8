//! Sharder (C9): partitions a resolved test catalog by `(shardIndex,
//! totalShards)` using the ceiling-division span rule in §4.8.

use crate::entity::Entity;

pub struct ShardPartition {
    pub included: Vec<Entity>,
    pub excluded: Vec<Entity>,
}

/// Partitions `catalog` into this shard's `Included` set and everyone
/// else's `Excluded` set. Skipped entities (pre-check already marked
/// `skip_reason`) are carried in shard 0's `Included` set in addition to
/// its computed span — a deliberate policy to centralize skip reporting
/// (§4.8, open question resolved per spec.md's stated intent in §9).
pub fn shard(catalog: &[Entity], shard_index: u32, total_shards: u32) -> ShardPartition {
    assert!(total_shards > 0, "total_shards must be positive");
    assert!(shard_index < total_shards, "shard_index out of range");

    let n = catalog.len();
    let span = ceil_div(n, total_shards as usize);
    let start = (shard_index as usize) * span;
    let end = if shard_index as usize + 1 == total_shards as usize {
        n
    } else {
        ((shard_index as usize + 1) * span).min(n)
    };
    let start = start.min(n);

    let mut included = Vec::new();
    let mut excluded = Vec::new();

    for (i, entity) in catalog.iter().enumerate() {
        let in_span = i >= start && i < end;
        let carried_skip_in_shard_zero = shard_index == 0 && entity.skip_reason.is_some();
        if in_span || carried_skip_in_shard_zero {
            included.push(entity.clone());
        } else {
            excluded.push(entity.clone());
        }
    }

    ShardPartition { included, excluded }
}

fn ceil_div(n: usize, d: usize) -> usize {
    if d == 0 {
        0
    } else {
        (n + d - 1) / d
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityVariant;

    fn catalog(names: &[&str]) -> Vec<Entity> {
        names
            .iter()
            .map(|name| Entity {
                name: name.to_string(),
                variant: EntityVariant::Test,
                pkg: "pkg".to_string(),
                desc: String::new(),
                contacts: vec![],
                data: vec![],
                software_deps: vec![],
                hardware_deps: vec![],
                timeout_secs: 30,
                bundle: "cros".to_string(),
                skip_reason: None,
            })
            .collect()
    }

    #[test]
    fn single_shard_includes_everything() {
        let catalog = catalog(&["a", "b", "c"]);
        let partition = shard(&catalog, 0, 1);
        assert_eq!(partition.included.len(), 3);
        assert!(partition.excluded.is_empty());
    }

    #[test]
    fn eleven_items_three_shards_ceiling_rule() {
        let names: Vec<String> = (0..11).map(|i| format!("t{i}")).collect();
        let catalog = catalog(&names.iter().map(|s| s.as_str()).collect::<Vec<_>>());

        let shard0 = shard(&catalog, 0, 3);
        let shard1 = shard(&catalog, 1, 3);
        let shard2 = shard(&catalog, 2, 3);

        assert_eq!(shard0.included.len(), 4);
        assert_eq!(shard1.included.len(), 4);
        assert_eq!(shard2.included.len(), 3);

        let mut union: Vec<String> = shard0
            .included
            .iter()
            .chain(shard1.included.iter())
            .chain(shard2.included.iter())
            .map(|e| e.name.clone())
            .collect();
        union.sort();
        let mut expected = names.clone();
        expected.sort();
        assert_eq!(union, expected);
    }

    #[test]
    fn partition_is_disjoint_across_shards() {
        let names: Vec<String> = (0..11).map(|i| format!("t{i}")).collect();
        let catalog = catalog(&names.iter().map(|s| s.as_str()).collect::<Vec<_>>());
        let shard0 = shard(&catalog, 0, 3);
        let shard1 = shard(&catalog, 1, 3);

        let names0: std::collections::HashSet<_> = shard0.included.iter().map(|e| &e.name).collect();
        let names1: std::collections::HashSet<_> = shard1.included.iter().map(|e| &e.name).collect();
        assert!(names0.is_disjoint(&names1));
    }

    #[test]
    fn skipped_tests_are_carried_into_shard_zero() {
        let mut catalog = catalog(&["a", "b", "c", "d"]);
        catalog[3].skip_reason = Some("missing dep".to_string());

        let shard0 = shard(&catalog, 0, 2);
        let shard1 = shard(&catalog, 1, 2);

        assert!(shard0.included.iter().any(|e| e.name == "d"));
        assert!(!shard1.included.iter().any(|e| e.name == "d"));
    }
}
