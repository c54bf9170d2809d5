use diesel::prelude::*;
use diesel::PgConnection;
use matchcore_shared::{CoreError, CoreResult};
use uuid::Uuid;

use crate::models::{canonical_pair, Chat, Match, MatchStatus, NewChat, NewMatch};
use crate::schema::{chats, matches};

/// Storage operations over `matches`/`chats`. Every method takes the caller's
/// connection so multi-row invariants (mutual-match activation, match↔chat
/// symmetry) can be enforced inside one transaction rather than each
/// method opening its own.
pub struct MatchStore;

impl MatchStore {
    /// Directional matches for the unordered pair, 0-2 rows, in no particular
    /// order. Both directions of the same unordered pair are returned because
    /// the caller needs to tell "my own row" from "the inverse row".
    ///
    /// Locks the matching rows with `FOR UPDATE` so this read and the
    /// insert/update that follows it inside the caller's transaction observe
    /// a consistent view of the pair — without this, two concurrent
    /// transactions completing symmetric missions for the same pair can both
    /// read "no inverse" and both insert a `pending_accept` row.
    pub fn find_by_unordered_pair(conn: &mut PgConnection, u1: Uuid, u2: Uuid) -> CoreResult<Vec<Match>> {
        matches::table
            .filter(
                (matches::primary_user_id.eq(u1).and(matches::secondary_user_id.eq(u2)))
                    .or(matches::primary_user_id.eq(u2).and(matches::secondary_user_id.eq(u1))),
            )
            .for_update()
            .load(conn)
            .map_err(CoreError::Database)
    }

    pub fn create(conn: &mut PgConnection, new_match: &NewMatch) -> CoreResult<Match> {
        diesel::insert_into(matches::table)
            .values(new_match)
            .get_result(conn)
            .map_err(CoreError::Database)
    }

    pub fn activate(conn: &mut PgConnection, id: Uuid) -> CoreResult<Match> {
        diesel::update(matches::table.find(id))
            .set((
                matches::status.eq(MatchStatus::Active.as_str()),
                matches::updated_at.eq(chrono::Utc::now()),
            ))
            .get_result(conn)
            .map_err(CoreError::Database)
    }

    /// One chat per unordered pair (`user_a_id`/`user_b_id` stored in
    /// canonical order), created only the first time two directions both
    /// become `active`.
    pub fn upsert_chat_for_pair(conn: &mut PgConnection, u1: Uuid, u2: Uuid) -> CoreResult<Chat> {
        let (a, b) = canonical_pair(u1, u2);

        let existing: Option<Chat> = chats::table
            .filter(chats::user_a_id.eq(a))
            .filter(chats::user_b_id.eq(b))
            .first(conn)
            .optional()
            .map_err(CoreError::Database)?;

        if let Some(chat) = existing {
            return Ok(chat);
        }

        diesel::insert_into(chats::table)
            .values(&NewChat {
                id: Uuid::now_v7(),
                user_a_id: a,
                user_b_id: b,
            })
            .get_result(conn)
            .map_err(CoreError::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_chat_ordering_is_stable_regardless_of_caller_order() {
        let u1 = Uuid::from_u128(5);
        let u2 = Uuid::from_u128(2);
        assert_eq!(canonical_pair(u1, u2), canonical_pair(u2, u1));
    }
}
