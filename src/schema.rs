// Quipu cache schema - mirrored node/edge tables for Diesel ORM
//
// Rows here are derived from authoritative git refs and may be rebuilt at
// any time by the hydrator.

diesel::table! {
    nodes (commit_hash) {
        commit_hash -> Text,
        output_tree -> Text,
        node_type -> Text,
        timestamp -> Text,
        summary -> Text,
        generator_id -> Text,
        meta_json -> Text,
        plan_md_cache -> Nullable<Text>,
    }
}

diesel::table! {
    edges (child_hash) {
        child_hash -> Text,
        parent_hash -> Text,
    }
}
