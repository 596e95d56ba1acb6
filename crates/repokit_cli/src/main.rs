//! Command-line driver for `repokit_core`.
//!
//! # Responsibility
//! - Verify core crate linkage (`ping`, `version`).
//! - Explain how a repository method name is derived into a query.
//! - Run a small seeded member/team scenario, optionally against SQLite.
//!
//! Set `REPOKIT_LOG_DIR` to an absolute directory to enable file logs.

use log::info;
use repokit_core::{
    derive_query, init_logging, EngineConfig, EntityRepository, EntityStore, Member,
    MemberService, PageRequest, QueryArg, QueryDescriptor, RepoResult, SortOrder, SqliteBoundary,
    StoreRepository, Team,
};
use std::process::ExitCode;

const USAGE: &str = "usage: repokit_cli [ping | version | explain <method> | demo [--db <path>] [--config <json>]]";

fn main() -> ExitCode {
    if let Ok(log_dir) = std::env::var("REPOKIT_LOG_DIR") {
        let level = std::env::var("REPOKIT_LOG_LEVEL")
            .unwrap_or_else(|_| repokit_core::default_log_level().to_string());
        if let Err(err) = init_logging(&level, &log_dir) {
            eprintln!("logging disabled: {err}");
        }
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        None | Some("ping") => {
            println!("repokit_core ping={}", repokit_core::ping());
            Ok(())
        }
        Some("version") => {
            println!("repokit_core version={}", repokit_core::core_version());
            Ok(())
        }
        Some("explain") => match args.get(1) {
            Some(method) => explain(method),
            None => Err(USAGE.to_string()),
        },
        Some("demo") => parse_demo_options(&args[1..]).and_then(|(db, config)| {
            demo(db.as_deref(), config).map_err(|err| err.to_string())
        }),
        Some(_) => Err(USAGE.to_string()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn explain(method: &str) -> Result<(), String> {
    let template = derive_query::<Member>(method).map_err(|err| err.to_string())?;
    println!("{template}");
    println!("arguments={}", template.arity());
    Ok(())
}

fn parse_demo_options(args: &[String]) -> Result<(Option<String>, EngineConfig), String> {
    let mut db = None;
    let mut config = EngineConfig::default();
    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let value = iter.next().ok_or_else(|| USAGE.to_string())?;
        match flag.as_str() {
            "--db" => db = Some(value.clone()),
            "--config" => {
                config = EngineConfig::from_json_str(value).map_err(|err| err.to_string())?
            }
            _ => return Err(USAGE.to_string()),
        }
    }
    Ok((db, config))
}

fn demo(db: Option<&str>, config: EngineConfig) -> RepoResult<()> {
    let store = match db {
        Some(path) => EntityStore::open(config, SqliteBoundary::open(path)?)?,
        None => EntityStore::new(config),
    };
    info!(
        "event=demo_start module=cli status=ok persistent={}",
        db.is_some()
    );

    let service = MemberService::new(
        StoreRepository::<Member>::new(&store),
        StoreRepository::<Team>::new(&store),
    );
    let mut uow = store.begin()?;

    if service.members().count(&uow)? == 0 {
        let team_a = service.teams().save(&mut uow, Team::new("teamA"))?;
        let team_b = service.teams().save(&mut uow, Team::new("teamB"))?;
        for (name, age, team) in [
            ("member1", 10, &team_a),
            ("member2", 20, &team_a),
            ("member3", 30, &team_b),
            ("member4", 40, &team_b),
        ] {
            service
                .members()
                .save(&mut uow, Member::in_team(name, age, team))?;
        }
    }

    let older = service
        .members()
        .find_by_method(&mut uow, "findByAgeGreaterThanOrderByAgeDesc", &[QueryArg::from(15)])?;
    println!("findByAgeGreaterThanOrderByAgeDesc(15) -> {older:?}");

    for row in service.find_member_dto(&uow)? {
        println!("dto id={} username={} team={}", row.id, row.username, row.team_name);
    }

    let page = service.members().find_page(
        &uow,
        &QueryDescriptor::find(),
        &PageRequest::sorted(0, 3, vec![SortOrder::desc("username")])?,
    )?;
    println!(
        "page 0 size 3: {:?} total_pages={}",
        page.content()
            .iter()
            .map(|member| member.username.as_str())
            .collect::<Vec<_>>(),
        page.total_pages()
    );

    let bumped = service.bulk_age_plus(&mut uow, 20)?;
    println!("bulk age +1 for age >= 20: {bumped} updated");

    uow.commit()?;
    Ok(())
}
