/**
 * GARDE D'AUTORISATION - Opérations réservées au détenteur de la carte
 *
 * La carte passée doit venir de `ReservationManager::get_board`, pour qu'une
 * réservation expirée soit déjà levée.
 */

use crate::error::{LabError, LabResult};
use crate::models::{Assignee, Board, Identity};

pub fn is_reserved_by(board: &Board, identity: &Identity) -> bool {
    match identity.name() {
        Some(name) => board.reservation().assignee.is(name),
        None => false,
    }
}

/// Fails with a message naming the current holder and the attempted operation
pub fn require_reserved_by(board: &Board, identity: &Identity, operation: &str) -> LabResult<()> {
    if is_reserved_by(board, identity) {
        return Ok(());
    }
    let holder = match board.reservation().assignee {
        Assignee::Nobody => "nobody".to_string(),
        Assignee::User(u) => u,
    };
    Err(LabError::Authorization {
        board: board.name().to_string(),
        holder,
        operation: operation.to_string(),
    })
}

pub fn require_user<'a>(identity: &'a Identity, operation: &str) -> LabResult<&'a str> {
    identity.name().ok_or_else(|| LabError::Unauthenticated {
        operation: operation.to_string(),
    })
}
