use repokit_core::query::QueryAction;
use repokit_core::{
    Condition, EngineConfig, EntityRepository, EntityStore, Example, ExampleMatcher, LoadPolicy,
    Member, MemberRepositoryCustom, MemberService, PageRequest, QueryArg, QueryDescriptor,
    QueryError, QueryOutcome, RepoError, SortOrder, Specification, StoreRepository, Team,
    ValidationError, ViewShape,
};

type Service<'s> = MemberService<StoreRepository<'s, Member>, StoreRepository<'s, Team>>;

fn service(store: &EntityStore) -> Service<'_> {
    MemberService::new(StoreRepository::new(store), StoreRepository::new(store))
}

#[test]
fn save_and_find_roundtrip() {
    let store = EntityStore::new(EngineConfig::default());
    let members = StoreRepository::<Member>::new(&store);
    let mut uow = store.begin().unwrap();

    let saved = members.save(&mut uow, Member::with_age("memberA", 10)).unwrap();
    let id = saved.id.unwrap();

    let found = members.find_by_id(&uow, id).unwrap().unwrap();
    assert_eq!(found, saved);
    assert_eq!(found.username, "memberA");
    assert!(members.exists_by_id(&uow, id).unwrap());
    assert!(members.find_by_id(&uow, id + 100).unwrap().is_none());
}

#[test]
fn basic_crud_drives_count_to_zero() {
    let store = EntityStore::new(EngineConfig::default());
    let members = StoreRepository::<Member>::new(&store);
    let mut uow = store.begin().unwrap();

    let member1 = members.save(&mut uow, Member::new("member1")).unwrap();
    let member2 = members.save(&mut uow, Member::new("member2")).unwrap();

    assert_eq!(members.find_all(&uow).unwrap().len(), 2);
    assert_eq!(members.count(&uow).unwrap(), 2);

    members.delete(&mut uow, &member1).unwrap();
    members.delete(&mut uow, &member2).unwrap();
    assert_eq!(members.count(&uow).unwrap(), 0);

    let err = members.delete(&mut uow, &member1).unwrap_err();
    assert!(matches!(err, RepoError::NotFound { id: Some(_), .. }));
    uow.commit().unwrap();
}

#[test]
fn delete_all_empties_the_table() {
    let store = EntityStore::new(EngineConfig::default());
    let members = StoreRepository::<Member>::new(&store);
    let mut uow = store.begin().unwrap();
    for name in ["a", "b", "c"] {
        members.save(&mut uow, Member::new(name)).unwrap();
    }

    assert_eq!(members.delete_all(&mut uow).unwrap(), 3);
    assert_eq!(members.count(&uow).unwrap(), 0);
}

#[test]
fn detached_copy_save_is_a_merge_with_version_check() {
    let store = EntityStore::new(EngineConfig::default());
    let members = StoreRepository::<Member>::new(&store);
    let mut uow = store.begin().unwrap();

    let original = members.save(&mut uow, Member::with_age("m1", 10)).unwrap();
    let mut first = original.clone();
    first.age = 11;
    let merged = members.save(&mut uow, first).unwrap();
    assert_eq!(merged.version, original.version + 1);

    let mut stale = original;
    stale.age = 99;
    let err = members.save(&mut uow, stale).unwrap_err();
    assert!(matches!(err, RepoError::OptimisticLockConflict { .. }));
    assert_eq!(members.find_by_id(&uow, merged.id.unwrap()).unwrap().unwrap().age, 11);
}

#[test]
fn derived_username_and_age_greater_than() {
    let store = EntityStore::new(EngineConfig::default());
    let service = service(&store);
    let mut uow = store.begin().unwrap();
    service.members().save(&mut uow, Member::with_age("AAA", 10)).unwrap();
    service.members().save(&mut uow, Member::with_age("AAA", 20)).unwrap();

    let result = service
        .find_by_username_and_age_greater_than(&mut uow, "AAA", 15)
        .unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].username, "AAA");
    assert_eq!(result[0].age, 20);
}

#[test]
fn derived_top3_and_count_queries() {
    let store = EntityStore::new(EngineConfig::default());
    let service = service(&store);
    let mut uow = store.begin().unwrap();
    for (name, age) in [("m1", 10), ("m2", 20), ("m3", 30), ("m4", 40)] {
        service.members().save(&mut uow, Member::with_age(name, age)).unwrap();
    }

    let top = service.find_top3(&mut uow).unwrap();
    let names: Vec<_> = top.iter().map(|m| m.username.as_str()).collect();
    assert_eq!(names, vec!["m1", "m2", "m3"]);

    let counted = service
        .members()
        .find_by_method(&mut uow, "countByAgeGreaterThanEqual", &[QueryArg::from(20)])
        .unwrap();
    assert_eq!(counted, QueryOutcome::Count(3));
}

#[test]
fn derived_related_attribute_and_reference() {
    let store = EntityStore::new(EngineConfig::default());
    let service = service(&store);
    let mut uow = store.begin().unwrap();
    let team_a = service.teams().save(&mut uow, Team::new("teamA")).unwrap();
    let team_b = service.teams().save(&mut uow, Team::new("teamB")).unwrap();
    service.members().save(&mut uow, Member::in_team("m1", 10, &team_a)).unwrap();
    service.members().save(&mut uow, Member::in_team("m2", 20, &team_b)).unwrap();
    service.members().save(&mut uow, Member::with_age("m3", 30)).unwrap();

    let by_name = service
        .members()
        .find_by_method(&mut uow, "findByTeamName", &[QueryArg::from("teamB")])
        .unwrap()
        .into_entities()
        .unwrap();
    assert_eq!(by_name.len(), 1);
    assert_eq!(by_name[0].username, "m2");

    let in_a = service.find_by_team(&uow, &team_a).unwrap();
    assert_eq!(in_a.len(), 1);
    assert_eq!(in_a[0].username, "m1");
}

#[test]
fn derived_query_errors_surface_before_scan() {
    let store = EntityStore::new(EngineConfig::default());
    let members = StoreRepository::<Member>::new(&store);
    let mut uow = store.begin().unwrap();

    let mixed = members
        .find_by_method(
            &mut uow,
            "findByUsernameAndAgeOrAge",
            &[QueryArg::from("a"), QueryArg::from(1), QueryArg::from(2)],
        )
        .unwrap_err();
    assert!(matches!(
        mixed,
        RepoError::Query(QueryError::MixedConnectors { .. })
    ));

    let arity = members
        .find_by_method(&mut uow, "findByAgeBetween", &[QueryArg::from(1)])
        .unwrap_err();
    assert!(matches!(
        arity,
        RepoError::Query(QueryError::ArgumentCount {
            expected: 2,
            actual: 1
        })
    ));

    let typed = members
        .find_by_method(&mut uow, "findByAge", &[QueryArg::from("ten")])
        .unwrap_err();
    assert!(matches!(typed, RepoError::Query(QueryError::TypeMismatch { .. })));
}

#[test]
fn paging_sorted_by_username_desc() {
    let store = EntityStore::new(EngineConfig::default());
    let service = service(&store);
    let mut uow = store.begin().unwrap();
    for name in ["member1", "member2", "member3", "member4", "member5"] {
        service.members().save(&mut uow, Member::with_age(name, 10)).unwrap();
    }

    let request = PageRequest::sorted(0, 3, vec![SortOrder::desc("username")]).unwrap();
    let first = service.find_by_age(&uow, 10, &request).unwrap();
    let names: Vec<_> = first.content().iter().map(|m| m.username.as_str()).collect();
    assert_eq!(names, vec!["member5", "member4", "member3"]);
    assert_eq!(first.total_elements(), 5);
    assert_eq!(first.total_pages(), 2);
    assert!(first.is_first());
    assert!(first.has_next());

    let second = service.find_by_age(&uow, 10, &request.next().unwrap()).unwrap();
    assert!(!second.has_next());
    let mut union: Vec<_> = first
        .into_content()
        .into_iter()
        .chain(second.into_content())
        .map(|m| m.username)
        .collect();
    let expected = vec!["member5", "member4", "member3", "member2", "member1"];
    assert_eq!(union, expected);
    union.sort();
    union.dedup();
    assert_eq!(union.len(), 5);
}

#[test]
fn page_sort_overrides_descriptor_sort() {
    let store = EntityStore::new(EngineConfig::default());
    let members = StoreRepository::<Member>::new(&store);
    let mut uow = store.begin().unwrap();
    for (name, age) in [("b", 1), ("a", 2), ("c", 3)] {
        members.save(&mut uow, Member::with_age(name, age)).unwrap();
    }

    let query = QueryDescriptor::find().order_by(SortOrder::desc("age"));
    let unsorted_page = members
        .find_page(&uow, &query, &PageRequest::of(0, 10).unwrap())
        .unwrap();
    let ages: Vec<_> = unsorted_page.content().iter().map(|m| m.age).collect();
    assert_eq!(ages, vec![3, 2, 1]);

    let by_name = PageRequest::sorted(0, 10, vec![SortOrder::asc("username")]).unwrap();
    let page = members.find_page(&uow, &query, &by_name).unwrap();
    let names: Vec<_> = page.content().iter().map(|m| m.username.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[test]
fn specification_with_related_clause() {
    let store = EntityStore::new(EngineConfig::default());
    let service = service(&store);
    let mut uow = store.begin().unwrap();
    let team_a = service.teams().save(&mut uow, Team::new("teamA")).unwrap();
    let team_b = service.teams().save(&mut uow, Team::new("teamB")).unwrap();
    service.members().save(&mut uow, Member::in_team("m1", 0, &team_a)).unwrap();
    service.members().save(&mut uow, Member::in_team("m2", 0, &team_a)).unwrap();
    service.members().save(&mut uow, Member::in_team("m1", 0, &team_b)).unwrap();
    service.members().save(&mut uow, Member::new("m1")).unwrap();

    let spec = Specification::attribute("username", Condition::eq("m1"))
        .and(Specification::related("team", "name", Condition::eq("teamA")));
    let result = service.members().find_all_matching(&uow, &spec).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].team_id, team_a.id);

    let neither = Specification::related("team", "name", Condition::eq("teamA")).not();
    assert_eq!(service.members().count_matching(&uow, &neither).unwrap(), 2);

    let required = Specification::related_required("team", "name", Condition::eq("teamA"));
    let err = service.members().find_all_matching(&uow, &required).unwrap_err();
    assert!(matches!(err, RepoError::JoinTargetMissing { id: None, .. }));
}

#[test]
fn dangling_team_reference_is_join_target_missing() {
    let store = EntityStore::new(EngineConfig::default());
    let service = service(&store);
    let mut uow = store.begin().unwrap();
    let team = service.teams().save(&mut uow, Team::new("teamA")).unwrap();
    service.members().save(&mut uow, Member::in_team("m1", 0, &team)).unwrap();
    service.teams().delete(&mut uow, &team).unwrap();

    let spec = Specification::related("team", "name", Condition::eq("teamA"));
    let err = service.members().find_all_matching(&uow, &spec).unwrap_err();
    assert!(matches!(err, RepoError::JoinTargetMissing { id: Some(_), .. }));

    let err = service.find_with_team(&mut uow, "m1").unwrap_err();
    assert!(matches!(err, RepoError::JoinTargetMissing { .. }));
}

#[test]
fn query_by_example_ignoring_age() {
    let store = EntityStore::new(EngineConfig::default());
    let service = service(&store);
    let mut uow = store.begin().unwrap();
    let team = service.teams().save(&mut uow, Team::new("teamA")).unwrap();
    service.members().save(&mut uow, Member::in_team("m1", 0, &team)).unwrap();
    service.members().save(&mut uow, Member::in_team("m2", 0, &team)).unwrap();

    let template = Member::with_age("m1", 55);
    let example = Example::of(&template)
        .with_related("team", &Team::new("teamA"))
        .matching(ExampleMatcher::matching().with_ignore_paths(["age"]));
    let result = service.members().find_by_example(&uow, &example).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].username, "m1");

    let nothing_left = Example::of(&template)
        .matching(ExampleMatcher::matching().with_ignore_paths(["username", "age"]));
    assert!(matches!(
        service.members().find_by_example(&uow, &nothing_left),
        Err(RepoError::EmptyExample)
    ));
}

#[test]
fn bulk_update_bumps_versions_and_stales_copies() {
    let store = EntityStore::new(EngineConfig::default());
    let service = service(&store);
    let mut uow = store.begin().unwrap();
    let mut saved = Vec::new();
    for (name, age) in [("m1", 10), ("m2", 19), ("m3", 20), ("m4", 21), ("m5", 40)] {
        saved.push(service.members().save(&mut uow, Member::with_age(name, age)).unwrap());
    }

    assert_eq!(service.bulk_age_plus(&mut uow, 20).unwrap(), 3);

    let m5 = service
        .find_optional_by_username(&uow, "m5")
        .unwrap()
        .unwrap();
    assert_eq!((m5.age, m5.version), (41, 1));

    let untouched = service.find_optional_by_username(&uow, "m1").unwrap().unwrap();
    assert_eq!((untouched.age, untouched.version), (10, 0));

    let stale = saved.pop().unwrap();
    assert!(matches!(
        service.members().save(&mut uow, stale),
        Err(RepoError::OptimisticLockConflict { .. })
    ));
}

#[test]
fn projections_and_dto() {
    let store = EntityStore::new(EngineConfig::default());
    let service = service(&store);
    let mut uow = store.begin().unwrap();
    let team = service.teams().save(&mut uow, Team::new("teamA")).unwrap();
    service.members().save(&mut uow, Member::in_team("m1", 0, &team)).unwrap();
    service.members().save(&mut uow, Member::with_age("m2", 0)).unwrap();

    let shape = ViewShape::of(["username"]).with_nested("team", ViewShape::of(["name"]));
    let views = service
        .find_projections_by_username(&uow, "m1", &shape)
        .unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].text("username"), Some("m1"));
    assert_eq!(views[0].get("age"), None);
    let nested = views[0]
        .related("team", service.members().resolver())
        .unwrap()
        .unwrap();
    assert_eq!(nested.text("name"), Some("teamA"));

    assert_eq!(service.find_username_list(&uow).unwrap(), vec!["m1", "m2"]);

    let rows = service.find_member_dto(&uow).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].team_name, "teamA");

    let unknown = ViewShape::of(["nickname"]);
    assert!(matches!(
        service.find_projections_by_username(&uow, "m1", &unknown),
        Err(RepoError::Projection(_))
    ));
}

#[test]
fn deferred_projection_loads_on_first_dereference() {
    let config = EngineConfig::default().with_load_policy(LoadPolicy::DeferredFetchById);
    let store = EntityStore::new(config);
    let service = service(&store);
    let mut uow = store.begin().unwrap();
    let team = service.teams().save(&mut uow, Team::new("teamA")).unwrap();
    service.members().save(&mut uow, Member::in_team("m1", 0, &team)).unwrap();

    let shape = ViewShape::of(["username"]).with_nested("team", ViewShape::of(["name"]));
    let views = service
        .find_projections_by_username(&uow, "m1", &shape)
        .unwrap();
    assert!(!views[0].is_loaded("team"));
    let nested = views[0]
        .related("team", service.members().resolver())
        .unwrap()
        .unwrap();
    assert_eq!(nested.text("name"), Some("teamA"));
    assert!(views[0].is_loaded("team"));
}

#[test]
fn entity_graph_read_fetches_team() {
    let store = EntityStore::new(EngineConfig::default());
    let service = service(&store);
    let mut uow = store.begin().unwrap();
    let team = service.teams().save(&mut uow, Team::new("teamA")).unwrap();
    service.members().save(&mut uow, Member::in_team("m1", 0, &team)).unwrap();
    service.members().save(&mut uow, Member::new("m1")).unwrap();

    let graph = service.find_with_team(&mut uow, "m1").unwrap();
    assert_eq!(graph.len(), 2);
    assert_eq!(graph[0].team.as_ref().map(|t| t.name.as_str()), Some("teamA"));
    assert!(graph[1].team.is_none());
}

#[test]
fn non_unique_optional_lookup_fails() {
    let store = EntityStore::new(EngineConfig::default());
    let service = service(&store);
    let mut uow = store.begin().unwrap();
    service.members().save(&mut uow, Member::new("dup")).unwrap();
    assert!(service.find_optional_by_username(&uow, "dup").unwrap().is_some());
    service.members().save(&mut uow, Member::new("dup")).unwrap();

    assert!(matches!(
        service.find_optional_by_username(&uow, "dup"),
        Err(RepoError::NonUniqueResult { count: 2 })
    ));
    assert!(service.find_optional_by_username(&uow, "none").unwrap().is_none());
}

#[test]
fn explicit_descriptor_matches_derived_one() {
    let store = EntityStore::new(EngineConfig::default());
    let members = StoreRepository::<Member>::new(&store);
    let mut uow = store.begin().unwrap();
    members.save(&mut uow, Member::with_age("x", 10)).unwrap();

    let derived = repokit_core::derive_query::<Member>("existsByUsernameAndAge")
        .unwrap()
        .bind(&[QueryArg::from("x"), QueryArg::from(10)])
        .unwrap();
    let mut explicit = QueryDescriptor::new(QueryAction::Exists)
        .filter("username", Condition::eq("x"))
        .filter("age", Condition::eq(10));
    assert_eq!(derived, explicit);

    explicit.action = QueryAction::Count;
    assert_eq!(members.execute(&mut uow, &explicit).unwrap().count(), Some(1));
}

#[test]
fn page_union_equals_sorted_result_for_every_size() {
    let store = EntityStore::new(EngineConfig::default());
    let members = StoreRepository::<Member>::new(&store);
    let mut uow = store.begin().unwrap();
    for (index, age) in [30, 10, 20, 10, 30, 20, 10].into_iter().enumerate() {
        members
            .save(&mut uow, Member::with_age(format!("m{index}"), age))
            .unwrap();
    }
    let query = QueryDescriptor::find().order_by(SortOrder::asc("age"));
    let expected: Vec<_> = members
        .select(&uow, &query)
        .unwrap()
        .into_iter()
        .map(|m| m.id.unwrap())
        .collect();
    assert_eq!(expected, vec![2, 4, 7, 3, 6, 1, 5]);

    for size in 1..=8 {
        let mut request = PageRequest::of(0, size).unwrap();
        let mut union = Vec::new();
        loop {
            let page = members.find_page(&uow, &query, &request).unwrap();
            assert_eq!(page.total_elements(), expected.len());
            assert_eq!(page.total_pages(), expected.len().div_ceil(size));
            assert_eq!(page.has_next(), (page.number() + 1) * size < expected.len());
            union.extend(page.content().iter().map(|m| m.id.unwrap()));
            if !page.has_next() {
                break;
            }
            request = request.next().unwrap();
        }
        assert_eq!(union, expected, "page size {size}");
    }
}

#[test]
fn invalid_members_are_never_stored() {
    let store = EntityStore::new(EngineConfig::default());
    let members = StoreRepository::<Member>::new(&store);
    let mut uow = store.begin().unwrap();

    assert!(matches!(
        members.save(&mut uow, Member::with_age("", 10)),
        Err(RepoError::Validation(ValidationError::BlankField { .. }))
    ));
    assert!(matches!(
        members.save(&mut uow, Member::with_age("m1", -3)),
        Err(RepoError::Validation(ValidationError::NegativeValue { .. }))
    ));
    assert!(uow.pending_writes().is_empty());
    assert_eq!(members.count(&uow).unwrap(), 0);
}

#[test]
fn read_only_and_custom_member_queries() {
    let store = EntityStore::new(EngineConfig::default());
    let service = service(&store);
    let mut uow = store.begin().unwrap();
    service
        .members()
        .save(&mut uow, Member::with_age("member1", 10))
        .unwrap();
    uow.flush().unwrap();
    uow.clear().unwrap();

    let found = service.find_read_only_by_username(&uow, "member1").unwrap();
    assert_eq!(found[0].username, "member1");
    uow.flush().unwrap();
    assert_eq!(store.members().get(1).unwrap().version, 0);

    let custom = service.members().find_member_custom(&uow).unwrap();
    assert_eq!(custom.len(), 1);
}
