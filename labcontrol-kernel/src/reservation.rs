/**
 * RÉSERVATIONS - Machine à états d'attribution des cartes
 *
 * RÔLE :
 * Attribuer, libérer et faire expirer les réservations portées par les
 * enregistrements de cartes.
 *
 * FONCTIONNEMENT :
 * - Lecture-vérification-écriture sans verrou sur l'object store : deux
 *   attributions simultanées d'une carte libre peuvent réussir, la dernière gagne
 * - Toute lecture passe par `get_board`, qui libère une réservation expirée
 * - Les hooks de libération (webterm) s'exécutent après l'écriture
 */

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::clock::Clock;
use crate::error::{LabError, LabResult};
use crate::gate;
use crate::models::{format_timestamp, Assignee, Board, Expiry, Identity, Reservation, ReservationState};
use crate::store::{validate_name, ObjectKind, ObjectStore};

/// Requested reservation length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationLength {
    Minutes(u32),
    Forever,
}

impl ReservationLength {
    /// Accepts a positive number of minutes or `forever`
    pub fn parse(value: &str) -> LabResult<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("forever") {
            return Ok(ReservationLength::Forever);
        }
        match value.parse::<u32>() {
            Ok(0) => Err(LabError::invalid("duration", "must be at least one minute")),
            Ok(m) => Ok(ReservationLength::Minutes(m)),
            Err(_) => Err(LabError::invalid(
                "duration",
                format!("'{value}' is neither a number of minutes nor 'forever'"),
            )),
        }
    }
}

/// Called after a board has been released, to revoke derived sessions
#[async_trait]
pub trait ReleaseHook: Send + Sync {
    async fn released(&self, board: &str);
}

pub struct ReservationManager {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    hooks: Vec<Arc<dyn ReleaseHook>>,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            hooks: Vec::new(),
        }
    }

    pub fn with_release_hook(mut self, hook: Arc<dyn ReleaseHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn list_boards(&self, pattern: &str) -> LabResult<Vec<String>> {
        self.store.list_matching(ObjectKind::Board, pattern)
    }

    /// Loads a board, clearing its reservation first when it has expired
    pub fn get_board(&self, name: &str) -> LabResult<Board> {
        validate_name("board", name)?;
        let mut board = Board::new(self.store.get(ObjectKind::Board, name)?);
        let reservation = board.reservation();
        if reservation.state(self.clock.now()) == ReservationState::Expired {
            let end = match reservation.end {
                Expiry::At(t) => format_timestamp(t),
                _ => String::new(),
            };
            info!(board = name, former_holder = %reservation.assignee, end_time = %end, "reservation expired, board released");
            board.set_reservation(&Reservation::free());
            self.store.put(ObjectKind::Board, board.record())?;
        }
        Ok(board)
    }

    pub fn assign(
        &self,
        name: &str,
        identity: &Identity,
        length: ReservationLength,
    ) -> LabResult<Board> {
        let user = gate::require_user(identity, "assign a board")?;
        if user == "nobody" {
            return Err(LabError::invalid("user", "'nobody' cannot hold a reservation"));
        }
        let mut board = self.get_board(name)?;
        if let Assignee::User(holder) = board.reservation().assignee {
            return Err(LabError::Conflict(format!(
                "board '{name}' is already assigned to {holder}"
            )));
        }

        let now = self.clock.now();
        let end = match length {
            ReservationLength::Forever => Expiry::Never,
            ReservationLength::Minutes(m) => now
                .checked_add(time::Duration::minutes(i64::from(m)))
                .map(Expiry::At)
                .ok_or_else(|| LabError::invalid("duration", "end time out of range"))?,
        };
        board.set_reservation(&Reservation::held_by(user, now, end));
        self.store.put(ObjectKind::Board, board.record())?;
        info!(board = name, user, ?length, "board assigned");
        Ok(board)
    }

    /// `force` skips the holder check; callers decide who may force
    pub async fn release(&self, name: &str, identity: &Identity, force: bool) -> LabResult<Board> {
        let mut board = self.get_board(name)?;
        if !force {
            gate::require_reserved_by(&board, identity, "release it")?;
        }
        let Assignee::User(holder) = board.reservation().assignee else {
            return Err(LabError::Conflict(format!("board '{name}' is not assigned")));
        };

        board.set_reservation(&Reservation::free());
        self.store.put(ObjectKind::Board, board.record())?;
        info!(board = name, former_holder = %holder, by = identity.name().unwrap_or("anonymous"), force, "board released");

        for hook in &self.hooks {
            hook.released(name).await;
        }
        Ok(board)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{ASSIGNED_TO, END_TIME};
    use crate::store::{MemoryStore, Record};
    use parking_lot::Mutex;
    use time::macros::datetime;
    use time::Duration;
    use tracing_test::traced_test;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        manager: ReservationManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.seed(ObjectKind::Board, Record::new("bbb").with(ASSIGNED_TO, "nobody"));
        let clock = Arc::new(ManualClock::new(datetime!(2024-03-01 12:00 UTC)));
        let manager = ReservationManager::new(store.clone(), clock.clone());
        Fixture {
            store,
            clock,
            manager,
        }
    }

    #[test]
    fn length_parsing() {
        assert_eq!(ReservationLength::parse("30").unwrap(), ReservationLength::Minutes(30));
        assert_eq!(ReservationLength::parse("forever").unwrap(), ReservationLength::Forever);
        assert!(ReservationLength::parse("0").is_err());
        assert!(ReservationLength::parse("-5").is_err());
        assert!(ReservationLength::parse("soon").is_err());
    }

    #[test]
    fn assign_sets_holder_and_end_time() {
        let f = fixture();
        let board = f
            .manager
            .assign("bbb", &Identity::user("alice"), ReservationLength::Minutes(30))
            .unwrap();
        let res = board.reservation();
        assert!(res.assignee.is("alice"));
        assert_eq!(res.end, Expiry::At(datetime!(2024-03-01 12:30 UTC)));
        assert_eq!(res.state(f.clock.now()), ReservationState::Reserved);
    }

    #[test]
    fn reassign_is_rejected_even_for_the_holder() {
        let f = fixture();
        let alice = Identity::user("alice");
        f.manager.assign("bbb", &alice, ReservationLength::Minutes(30)).unwrap();

        let err = f
            .manager
            .assign("bbb", &Identity::user("bob"), ReservationLength::Minutes(10))
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert!(err.to_string().contains("already assigned to alice"));

        let again = f.manager.assign("bbb", &alice, ReservationLength::Minutes(30));
        assert!(again.is_err());
    }

    #[test]
    fn anonymous_cannot_assign() {
        let f = fixture();
        let err = f
            .manager
            .assign("bbb", &Identity::Anonymous, ReservationLength::Forever)
            .unwrap_err();
        assert_eq!(err.kind(), "unauthenticated");
    }

    #[traced_test]
    #[test]
    fn expiry_on_read_writes_once() {
        let f = fixture();
        f.manager
            .assign("bbb", &Identity::user("alice"), ReservationLength::Minutes(30))
            .unwrap();
        let writes_after_assign = f.store.writes();

        f.clock.advance(Duration::minutes(31));
        let board = f.manager.get_board("bbb").unwrap();
        assert_eq!(board.reservation(), Reservation::free());
        assert_eq!(f.store.writes(), writes_after_assign + 1);
        assert!(logs_contain("reservation expired"));

        f.manager.get_board("bbb").unwrap();
        assert_eq!(f.store.writes(), writes_after_assign + 1);
    }

    #[test]
    fn expired_board_can_be_reassigned() {
        let f = fixture();
        f.manager
            .assign("bbb", &Identity::user("alice"), ReservationLength::Minutes(30))
            .unwrap();
        f.clock.advance(Duration::hours(1));

        let board = f
            .manager
            .assign("bbb", &Identity::user("bob"), ReservationLength::Forever)
            .unwrap();
        assert_eq!(board.record().get_str(END_TIME), Some("never"));
        assert!(board.reservation().assignee.is("bob"));
    }

    #[tokio::test]
    async fn release_requires_holder_unless_forced() {
        let f = fixture();
        f.manager
            .assign("bbb", &Identity::user("alice"), ReservationLength::Forever)
            .unwrap();

        let err = f
            .manager
            .release("bbb", &Identity::user("bob"), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "authorization");
        assert!(err.to_string().contains("alice"));

        let board = f
            .manager
            .release("bbb", &Identity::admin("root"), true)
            .await
            .unwrap();
        assert_eq!(board.reservation(), Reservation::free());
    }

    #[tokio::test]
    async fn releasing_a_free_board_fails() {
        let f = fixture();
        let err = f
            .manager
            .release("bbb", &Identity::user("alice"), true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");

        let err = f
            .manager
            .release("bbb", &Identity::user("alice"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Authorization { ref holder, .. } if holder == "nobody"));
        assert_eq!(f.store.writes(), 0);
    }

    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl ReleaseHook for Recorder {
        async fn released(&self, board: &str) {
            self.0.lock().push(board.to_string());
        }
    }

    #[tokio::test]
    async fn release_runs_hooks() {
        let store = Arc::new(MemoryStore::new());
        store.seed(ObjectKind::Board, Record::new("bbb"));
        let clock = Arc::new(ManualClock::new(datetime!(2024-03-01 12:00 UTC)));
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let manager = ReservationManager::new(store, clock).with_release_hook(recorder.clone());

        let alice = Identity::user("alice");
        manager.assign("bbb", &alice, ReservationLength::Minutes(5)).unwrap();
        manager.release("bbb", &alice, false).await.unwrap();
        assert_eq!(*recorder.0.lock(), vec!["bbb".to_string()]);
    }

    #[test]
    fn unknown_board_is_not_found() {
        let f = fixture();
        assert_eq!(f.manager.get_board("zynq").unwrap_err().kind(), "not_found");
    }
}
