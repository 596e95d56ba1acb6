//! SQLite-backed persistence boundary.
//!
//! # Responsibility
//! - Stage flushed writes per unit of work.
//! - Apply a unit's staged writes in one SQLite transaction on commit.
//! - Read persisted rows back when a store is opened.
//!
//! # Invariants
//! - Nothing reaches the database before commit.
//! - A failed commit leaves the database unchanged.
//! - Read paths reject invalid persisted state instead of masking it.

use super::{open_db, open_db_in_memory, DbError, DbResult};
use crate::model::entity::{EntityId, EntityKind, Record};
use crate::model::member::Member;
use crate::model::team::Team;
use crate::repo::unit_of_work::{PendingWrite, PersistenceBoundary, UnitOfWorkId};
use crate::repo::{RepoError, RepoResult};
use log::{debug, error, info};
use rusqlite::{params, Connection, Row, Transaction};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

const TEAM_SELECT_SQL: &str = "SELECT id, version, name FROM teams ORDER BY id";
const MEMBER_SELECT_SQL: &str =
    "SELECT id, version, username, age, team_id FROM members ORDER BY id";

pub struct SqliteBoundary {
    conn: Mutex<Connection>,
    staged: Mutex<HashMap<UnitOfWorkId, Vec<PendingWrite>>>,
}

impl SqliteBoundary {
    /// Wraps an already migrated connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            staged: Mutex::new(HashMap::new()),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        open_db(path).map(Self::new)
    }

    pub fn open_in_memory() -> DbResult<Self> {
        open_db_in_memory().map(Self::new)
    }

    /// Number of persisted rows of `kind`.
    pub fn persisted_count(&self, kind: EntityKind) -> DbResult<usize> {
        let sql = match kind {
            EntityKind::Member => "SELECT COUNT(*) FROM members",
            EntityKind::Team => "SELECT COUNT(*) FROM teams",
        };
        let count: i64 = self.connection().query_row(sql, [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn staged(&self) -> MutexGuard<'_, HashMap<UnitOfWorkId, Vec<PendingWrite>>> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistenceBoundary for SqliteBoundary {
    fn load(&self) -> RepoResult<Vec<Record>> {
        let conn = self.connection();
        let mut records = Vec::new();

        let mut stmt = conn.prepare(TEAM_SELECT_SQL)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            records.push(Record::Team(parse_team_row(row)?));
        }

        let mut stmt = conn.prepare(MEMBER_SELECT_SQL)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            records.push(Record::Member(parse_member_row(row)?));
        }

        Ok(records)
    }

    fn begin(&self, uow: UnitOfWorkId) -> RepoResult<()> {
        self.staged().insert(uow, Vec::new());
        Ok(())
    }

    fn flush(&self, uow: UnitOfWorkId, writes: Vec<PendingWrite>) -> RepoResult<()> {
        self.staged().entry(uow).or_default().extend(writes);
        Ok(())
    }

    fn commit(&self, uow: UnitOfWorkId) -> RepoResult<()> {
        let started_at = Instant::now();
        let writes = self
            .staged()
            .remove(&uow)
            .ok_or(DbError::UnknownUnitOfWork(uow))?;
        if writes.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection();
        let tx = conn.transaction()?;
        for write in &writes {
            if let Err(err) = apply_write(&tx, write) {
                error!(
                    "event=db_commit module=db status=error uow={uow} error_code=write_failed error={err}"
                );
                return Err(err);
            }
        }
        tx.commit()?;

        info!(
            "event=db_commit module=db status=ok uow={uow} writes={} duration_ms={}",
            writes.len(),
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    fn rollback(&self, uow: UnitOfWorkId) -> RepoResult<()> {
        let discarded = self.staged().remove(&uow).map_or(0, |writes| writes.len());
        debug!("event=db_rollback module=db status=ok uow={uow} discarded={discarded}");
        Ok(())
    }
}

fn apply_write(tx: &Transaction<'_>, write: &PendingWrite) -> RepoResult<()> {
    match write {
        PendingWrite::Upsert(Record::Team(team)) => {
            tx.execute(
                "INSERT INTO teams (id, version, name) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    version = excluded.version,
                    name = excluded.name;",
                params![
                    identity(team.id)?,
                    version_to_db(team.version)?,
                    team.name.as_str(),
                ],
            )?;
        }
        PendingWrite::Upsert(Record::Member(member)) => {
            tx.execute(
                "INSERT INTO members (id, version, username, age, team_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    version = excluded.version,
                    username = excluded.username,
                    age = excluded.age,
                    team_id = excluded.team_id;",
                params![
                    identity(member.id)?,
                    version_to_db(member.version)?,
                    member.username.as_str(),
                    member.age,
                    member.team_id.map(id_to_db).transpose()?,
                ],
            )?;
        }
        PendingWrite::Delete { kind, id } => {
            let sql = match kind {
                EntityKind::Member => "DELETE FROM members WHERE id = ?1;",
                EntityKind::Team => "DELETE FROM teams WHERE id = ?1;",
            };
            tx.execute(sql, [id_to_db(*id)?])?;
        }
    }
    Ok(())
}

fn parse_team_row(row: &Row<'_>) -> RepoResult<Team> {
    Ok(Team {
        id: Some(id_from_db(row.get("id")?, "teams.id")?),
        version: version_from_db(row.get("version")?, "teams.version")?,
        name: row.get("name")?,
    })
}

fn parse_member_row(row: &Row<'_>) -> RepoResult<Member> {
    let team_id = match row.get::<_, Option<i64>>("team_id")? {
        Some(value) => Some(id_from_db(value, "members.team_id")?),
        None => None,
    };
    Ok(Member {
        id: Some(id_from_db(row.get("id")?, "members.id")?),
        version: version_from_db(row.get("version")?, "members.version")?,
        username: row.get("username")?,
        age: row.get("age")?,
        team_id,
    })
}

fn identity(id: Option<EntityId>) -> RepoResult<i64> {
    id_to_db(id.ok_or_else(|| RepoError::InvalidData("entity without identity".to_string()))?)
}

fn id_to_db(id: EntityId) -> RepoResult<i64> {
    i64::try_from(id).map_err(|_| RepoError::InvalidData(format!("identity {id} out of range")))
}

fn version_to_db(version: u64) -> RepoResult<i64> {
    i64::try_from(version)
        .map_err(|_| RepoError::InvalidData(format!("version {version} out of range")))
}

fn id_from_db(value: i64, column: &str) -> RepoResult<EntityId> {
    EntityId::try_from(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid identity `{value}` in {column}")))
}

fn version_from_db(value: i64, column: &str) -> RepoResult<u64> {
    u64::try_from(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid version `{value}` in {column}")))
}

#[cfg(test)]
mod tests {
    use super::SqliteBoundary;
    use crate::model::entity::{EntityKind, Record};
    use crate::model::member::Member;
    use crate::model::team::Team;
    use crate::repo::unit_of_work::{PendingWrite, PersistenceBoundary};
    use uuid::Uuid;

    fn stored_team() -> Team {
        let mut team = Team::new("teamA");
        team.id = Some(1);
        team
    }

    #[test]
    fn staged_writes_are_invisible_until_commit() {
        let boundary = SqliteBoundary::open_in_memory().unwrap();
        let uow = Uuid::new_v4();
        boundary.begin(uow).unwrap();
        boundary
            .flush(uow, vec![PendingWrite::Upsert(Record::Team(stored_team()))])
            .unwrap();
        assert_eq!(boundary.persisted_count(EntityKind::Team).unwrap(), 0);

        boundary.commit(uow).unwrap();
        assert_eq!(boundary.persisted_count(EntityKind::Team).unwrap(), 1);
    }

    #[test]
    fn rollback_discards_staged_writes() {
        let boundary = SqliteBoundary::open_in_memory().unwrap();
        let uow = Uuid::new_v4();
        boundary.begin(uow).unwrap();
        boundary
            .flush(uow, vec![PendingWrite::Upsert(Record::Team(stored_team()))])
            .unwrap();
        boundary.rollback(uow).unwrap();
        assert!(boundary.commit(uow).is_err());
        assert_eq!(boundary.persisted_count(EntityKind::Team).unwrap(), 0);
    }

    #[test]
    fn upsert_then_delete_round_trips_through_load() {
        let boundary = SqliteBoundary::open_in_memory().unwrap();
        let team = stored_team();
        let mut member = Member::in_team("m1", 12, &team);
        member.id = Some(1);
        let mut gone = Member::new("gone");
        gone.id = Some(2);

        let uow = Uuid::new_v4();
        boundary.begin(uow).unwrap();
        boundary
            .flush(
                uow,
                vec![
                    PendingWrite::Upsert(Record::Team(team.clone())),
                    PendingWrite::Upsert(Record::Member(member.clone())),
                    PendingWrite::Upsert(Record::Member(gone)),
                    PendingWrite::Delete {
                        kind: EntityKind::Member,
                        id: 2,
                    },
                ],
            )
            .unwrap();
        boundary.commit(uow).unwrap();

        let records = boundary.load().unwrap();
        assert_eq!(records, vec![Record::Team(team), Record::Member(member)]);
    }
}
