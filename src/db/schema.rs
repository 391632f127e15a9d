// SQLite schema definitions. Timestamps are stored as RFC 3339 text in UTC so
// lexical comparison matches chronological order.

diesel::table! {
    users (id) {
        id -> BigInt,
        display_name -> Text,
        upvotes_received -> BigInt,
        downvotes_received -> BigInt,
        score_offset -> BigInt,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    messages (id) {
        id -> BigInt,
        channel_id -> BigInt,
        community_id -> BigInt,
        author_id -> BigInt,
        content -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    votes (voter_id, message_id, direction) {
        voter_id -> BigInt,
        message_id -> BigInt,
        direction -> Integer,
        author_id -> BigInt,
        created_at -> Text,
    }
}

diesel::table! {
    fan_haters (subject_id, other_id) {
        subject_id -> BigInt,
        other_id -> BigInt,
        upvotes_given -> BigInt,
        downvotes_given -> BigInt,
    }
}

diesel::table! {
    community_settings (community_id) {
        community_id -> BigInt,
        upvote_symbol -> Text,
        downvote_symbol -> Text,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    scan_watermarks (channel_id) {
        channel_id -> BigInt,
        community_id -> BigInt,
        last_message_id -> BigInt,
        last_message_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    transactions (id) {
        id -> BigInt,
        user_id -> BigInt,
        delta -> BigInt,
        reason -> Text,
        created_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    users,
    messages,
    votes,
    fan_haters,
    community_settings,
    scan_watermarks,
    transactions,
);
