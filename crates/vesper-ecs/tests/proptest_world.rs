//! Property tests for world lifecycle operations.
//!
//! Random operation sequences run against a reference model; after every
//! step the world's component presence, activation state, and context
//! membership must agree with the model.

use std::collections::BTreeMap;

use proptest::prelude::*;
use vesper_ecs::prelude::*;

#[derive(Debug, Clone, PartialEq)]
struct A(u8);

#[derive(Debug, Clone, PartialEq)]
struct B(u8);

/// Operations the property test performs on the world.
#[derive(Debug, Clone)]
enum Op {
    Spawn { with_a: bool, with_b: bool },
    AddA(usize),
    AddB(usize),
    RemoveA(usize),
    RemoveB(usize),
    Destroy(usize),
    Deactivate(usize),
    Activate(usize),
    Update,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<bool>(), any::<bool>()).prop_map(|(with_a, with_b)| Op::Spawn { with_a, with_b }),
        (0..16usize).prop_map(Op::AddA),
        (0..16usize).prop_map(Op::AddB),
        (0..16usize).prop_map(Op::RemoveA),
        (0..16usize).prop_map(Op::RemoveB),
        (0..16usize).prop_map(Op::Destroy),
        (0..16usize).prop_map(Op::Deactivate),
        (0..16usize).prop_map(Op::Activate),
        Just(Op::Update),
    ]
}

/// What the model believes about one entity.
#[derive(Debug, Clone, Copy, Default)]
struct ModelEntity {
    a: bool,
    b: bool,
    deactivated: bool,
    destroyed: bool,
}

fn fresh_world() -> World {
    World::builder()
        .with_config(WorldConfig { diagnostics: false })
        .register_component::<A>(ComponentDecl::new())
        .register_component::<B>(ComponentDecl::new())
        .build()
}

/// Pick a model entity for an index-shaped operand.
fn pick(model: &BTreeMap<EntityId, ModelEntity>, index: usize) -> Option<EntityId> {
    if model.is_empty() {
        return None;
    }
    model.keys().nth(index % model.len()).copied()
}

fn check_agreement(world: &mut World, model: &BTreeMap<EntityId, ModelEntity>) {
    for (&id, m) in model {
        let entity = world
            .try_get_entity(id)
            .expect("model entities exist until the update that disposes them");
        assert_eq!(world.has_component::<A>(id), m.a, "A presence for {id}");
        assert_eq!(world.has_component::<B>(id), m.b, "B presence for {id}");
        assert_eq!(entity.is_deactivated(), m.deactivated, "activity for {id}");
        assert_eq!(entity.is_destroyed(), m.destroyed, "destroyed for {id}");
    }

    let expected_active = model.values().filter(|m| !m.deactivated).count();
    assert_eq!(world.entity_count(), expected_active);

    // Context membership mirrors the predicate over live, active entities.
    let mut expected: Vec<EntityId> = model
        .iter()
        .filter(|(_, m)| m.a && !m.deactivated && !m.destroyed)
        .map(|(id, _)| *id)
        .collect();
    expected.sort();
    let mut members = world.get_entities_with(&[target::<A>()]);
    members.sort();
    assert_eq!(members, expected, "context membership for all_of [A]");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn random_lifecycle_sequences_agree_with_the_model(
        ops in prop::collection::vec(op_strategy(), 1..60),
    ) {
        let mut world = fresh_world();
        let mut model: BTreeMap<EntityId, ModelEntity> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Spawn { with_a, with_b } => {
                    let mut bundle = ComponentBundle::new();
                    if with_a {
                        bundle.add(A(0));
                    }
                    if with_b {
                        bundle.add(B(0));
                    }
                    let id = world.add_entity(bundle);
                    model.insert(id, ModelEntity { a: with_a, b: with_b, ..ModelEntity::default() });
                }
                Op::AddA(i) => {
                    if let Some(id) = pick(&model, i) {
                        world.add_component(id, A(1));
                        let m = model.get_mut(&id).unwrap();
                        if !m.destroyed && !m.a {
                            m.a = true;
                        }
                    }
                }
                Op::AddB(i) => {
                    if let Some(id) = pick(&model, i) {
                        world.add_component(id, B(1));
                        let m = model.get_mut(&id).unwrap();
                        if !m.destroyed && !m.b {
                            m.b = true;
                        }
                    }
                }
                Op::RemoveA(i) => {
                    if let Some(id) = pick(&model, i) {
                        world.remove_component::<A>(id);
                        let m = model.get_mut(&id).unwrap();
                        if !m.destroyed && m.a {
                            m.a = false;
                            if !m.b {
                                // Removing the last component destroys.
                                m.destroyed = true;
                            }
                        }
                    }
                }
                Op::RemoveB(i) => {
                    if let Some(id) = pick(&model, i) {
                        world.remove_component::<B>(id);
                        let m = model.get_mut(&id).unwrap();
                        if !m.destroyed && m.b {
                            m.b = false;
                            if !m.a {
                                m.destroyed = true;
                            }
                        }
                    }
                }
                Op::Destroy(i) => {
                    if let Some(id) = pick(&model, i) {
                        world.destroy_entity(id);
                        model.get_mut(&id).unwrap().destroyed = true;
                    }
                }
                Op::Deactivate(i) => {
                    if let Some(id) = pick(&model, i) {
                        world.deactivate_entity(id);
                        let m = model.get_mut(&id).unwrap();
                        if !m.destroyed {
                            m.deactivated = true;
                        }
                    }
                }
                Op::Activate(i) => {
                    if let Some(id) = pick(&model, i) {
                        world.activate_entity(id);
                        let m = model.get_mut(&id).unwrap();
                        if !m.destroyed {
                            m.deactivated = false;
                        }
                    }
                }
                Op::Update => {
                    world.update();
                    // The phase end disposed every destroyed entity.
                    let destroyed: Vec<EntityId> = model
                        .iter()
                        .filter(|(_, m)| m.destroyed)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in destroyed {
                        model.remove(&id);
                        prop_assert!(world.try_get_entity(id).is_none());
                    }
                    prop_assert!(world.watchers_idle());
                }
            }

            check_agreement(&mut world, &model);
        }
    }

    #[test]
    fn entity_ids_are_strictly_increasing(spawns in 2..40usize) {
        let mut world = fresh_world();
        let mut previous: Option<EntityId> = None;
        for i in 0..spawns {
            let id = world.add_entity(ComponentBundle::new().with(A(i as u8)));
            if let Some(prev) = previous {
                prop_assert!(id > prev);
            }
            previous = Some(id);

            // Destroy every other entity; ids must still never recycle.
            if i % 2 == 0 {
                world.destroy_entity(id);
                world.update();
            }
        }
    }
}
