//! Cache key helpers.
//!
//! Keys are `namespace:id`. Namespaced clears and real-time invalidation rely on the `namespace:` prefix, so build
//! keys through these helpers rather than by hand.

use std::fmt::Display;

pub const TOURNAMENT: &str = "tournament";
pub const MATCH: &str = "match";
pub const PLAYER: &str = "player";
pub const LEADERBOARD: &str = "leaderboard";

pub fn key(namespace: &str, id: impl Display) -> String {
    format!("{namespace}:{id}")
}

pub fn tournament(id: impl Display) -> String {
    key(TOURNAMENT, id)
}

// `match` is a keyword.
pub fn match_(id: impl Display) -> String {
    key(MATCH, id)
}

pub fn player(id: impl Display) -> String {
    key(PLAYER, id)
}

pub fn leaderboard(tournament_id: impl Display) -> String {
    key(LEADERBOARD, tournament_id)
}

/// Prefix that [`TtlCache::clear_namespace`](crate::cache::TtlCache::clear_namespace) takes for `namespace`.
pub fn prefix(namespace: &str) -> String {
    format!("{namespace}:")
}

/// The namespace part of `key`, or the whole key when it has none.
pub fn namespace_of(key: &str) -> &str {
    key.split_once(':').map_or(key, |(ns, _)| ns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_and_splits() {
        assert_eq!(tournament(1), "tournament:1");
        assert_eq!(match_("abc"), "match:abc");
        assert_eq!(leaderboard(7), "leaderboard:7");
        assert_eq!(prefix(PLAYER), "player:");
        assert_eq!(namespace_of(&player(3)), "player");
        assert_eq!(namespace_of("match:1:round:2"), "match");
        assert_eq!(namespace_of("plain"), "plain");
    }
}
