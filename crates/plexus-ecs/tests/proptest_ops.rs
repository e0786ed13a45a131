//! Property tests for container and protocol invariants.
//!
//! These tests use `proptest` to generate random sequences of world
//! operations and verify after every step that connected views hold exactly
//! the matching subset of live members and that entity ids stay stable for
//! members and absent for removed entities.

use std::collections::HashMap;

use plexus_ecs::prelude::*;
use proptest::prelude::*;
use serde_json::json;

const COMPONENTS: [&str; 3] = ["position", "velocity", "health"];

/// Operations we can perform on the world. Entity indices are taken modulo
/// the number of live entities at application time.
#[derive(Debug, Clone)]
enum Op {
    /// Spawn with the components selected by the low three mask bits.
    Spawn(u8),
    Despawn(usize),
    AddComponent(usize, usize),
    RemoveComponent(usize, usize),
    SetComponent(usize, usize, i64),
    Clear,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => any::<u8>().prop_map(Op::Spawn),
        2 => (0..64usize).prop_map(Op::Despawn),
        3 => (0..64usize, 0..COMPONENTS.len()).prop_map(|(e, c)| Op::AddComponent(e, c)),
        3 => (0..64usize, 0..COMPONENTS.len()).prop_map(|(e, c)| Op::RemoveComponent(e, c)),
        2 => (0..64usize, 0..COMPONENTS.len(), -100..100i64)
            .prop_map(|(e, c, v)| Op::SetComponent(e, c, v)),
        1 => Just(Op::Clear),
    ]
}

fn spawn_masked(world: &World, mask: u8) -> EntityRef {
    let mut entity = Entity::new();
    for (bit, name) in COMPONENTS.iter().enumerate() {
        if mask & (1 << bit) != 0 {
            entity = entity.with(*name, json!(0));
        }
    }
    world.spawn(entity)
}

/// Every connected view must hold exactly the live members matching its
/// configuration.
fn assert_views_exact(
    world: &World,
    alive: &[EntityRef],
    views: &[(Query, fn(&EntityRef) -> bool)],
) -> Result<(), TestCaseError> {
    for (view, matches) in views {
        let expected: Vec<&EntityRef> = alive.iter().filter(|e| matches(e)).collect();
        prop_assert_eq!(view.size(), expected.len());
        for entity in &expected {
            prop_assert!(view.has(entity));
        }
        for entity in view.iter() {
            prop_assert!(world.has(&entity));
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    #[test]
    fn random_ops_preserve_view_and_id_invariants(
        ops in prop::collection::vec(op_strategy(), 1..40)
    ) {
        let world = World::new();

        // Connect a representative spread of views up front.
        let views: Vec<(Query, fn(&EntityRef) -> bool)> = vec![
            (world.with(["position"]), |e| e.borrow().has("position")),
            (world.with(["position", "velocity"]), |e| {
                has_components(&e.borrow(), &["position", "velocity"])
            }),
            (world.without(["health"]), |e| !e.borrow().has("health")),
        ];
        for (view, _) in &views {
            view.connect();
        }

        let mut alive: Vec<EntityRef> = Vec::new();
        let mut known_ids: HashMap<EntityRef, EntityId> = HashMap::new();

        for op in ops {
            match op {
                Op::Spawn(mask) => {
                    alive.push(spawn_masked(&world, mask));
                }
                Op::Despawn(index) => {
                    if !alive.is_empty() {
                        let entity = alive.remove(index % alive.len());
                        world.remove(&entity);
                        known_ids.remove(&entity);
                        prop_assert_eq!(world.id(&entity), None);
                    }
                }
                Op::AddComponent(index, component) => {
                    if !alive.is_empty() {
                        let entity = &alive[index % alive.len()];
                        world
                            .add_component(entity, COMPONENTS[component], json!(0))
                            .unwrap();
                        prop_assert!(entity.borrow().has(COMPONENTS[component]));
                    }
                }
                Op::RemoveComponent(index, component) => {
                    if !alive.is_empty() {
                        let entity = &alive[index % alive.len()];
                        world.remove_component(entity, COMPONENTS[component]).unwrap();
                        prop_assert!(!entity.borrow().has(COMPONENTS[component]));
                    }
                }
                Op::SetComponent(index, component, value) => {
                    if !alive.is_empty() {
                        let entity = &alive[index % alive.len()];
                        let present = entity.borrow().has(COMPONENTS[component]);
                        world
                            .set_component(entity, COMPONENTS[component], json!(value))
                            .unwrap();
                        if present {
                            let entity_ref = entity.borrow();
                            prop_assert_eq!(
                                entity_ref.get(COMPONENTS[component]),
                                Some(&json!(value))
                            );
                        } else {
                            prop_assert!(!entity.borrow().has(COMPONENTS[component]));
                        }
                    }
                }
                Op::Clear => {
                    world.clear();
                    alive.clear();
                    known_ids.clear();
                }
            }

            // Size matches the model.
            prop_assert_eq!(world.size(), alive.len());

            // Views hold exactly the matching subset.
            assert_views_exact(&world, &alive, &views)?;

            // Ids are stable for members, absent never resurrects.
            for entity in &alive {
                let id = world.id(entity).expect("members always have ids on request");
                if let Some(&previous) = known_ids.get(entity) {
                    prop_assert_eq!(id, previous);
                } else {
                    known_ids.insert(entity.clone(), id);
                }
                prop_assert_eq!(world.entity(id), Some(entity.clone()));
            }
        }
    }

    /// Reverse iteration visits each live member exactly once even when the
    /// loop body removes every yielded entity.
    #[test]
    fn drain_via_iteration_visits_each_entity_once(masks in prop::collection::vec(any::<u8>(), 1..20)) {
        let world = World::new();
        for mask in &masks {
            spawn_masked(&world, *mask);
        }

        let mut visited = 0usize;
        for entity in world.iter() {
            world.remove(&entity);
            visited += 1;
        }

        prop_assert_eq!(visited, masks.len());
        prop_assert!(world.is_empty());
    }
}
