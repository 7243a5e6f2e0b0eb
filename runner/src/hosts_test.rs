use crate::hosts::{parse_hosts, NodeList, NodePool};

fn expand(src: &str) -> Vec<String> {
    parse_hosts(src).unwrap()
}

#[test]
pub fn plain_names_pass_through() {
    assert_eq!(expand("n1"), vec!["n1"]);
    assert_eq!(expand("n1,n2,gpu1"), vec!["n1", "n2", "gpu1"]);
}

#[test]
pub fn groups_expand_with_their_prefix() {
    assert_eq!(
        expand("h[1-4,a,b,06-8]"),
        vec!["h1", "h2", "h3", "h4", "ha", "hb", "h06", "h07", "h08"]
    );
    assert_eq!(
        expand("n1,gpu[1-3]"),
        vec!["n1", "gpu1", "gpu2", "gpu3"]
    );
}

#[test]
pub fn ranges_keep_the_start_token_padding() {
    assert_eq!(expand("n[08-11]"), vec!["n08", "n09", "n10", "n11"]);
    assert_eq!(expand("n[8-11]"), vec!["n8", "n9", "n10", "n11"]);
}

#[test]
pub fn a_range_ending_the_input_still_expands() {
    assert_eq!(expand("gpu[1-2],5-7"), vec!["gpu1", "gpu2", "5", "6", "7"]);
}

#[test]
pub fn duplicate_names_collapse() {
    assert_eq!(expand("a,b,a"), vec!["a", "b"]);
    assert_eq!(expand("n[1-2],n2"), vec!["n1", "n2"]);
}

#[test]
pub fn invalid_expressions_point_at_the_offending_character() {
    let error = parse_hosts("").unwrap_err();
    assert_eq!((error.pos, error.msg), (0, "empty hosts list"));

    let error = parse_hosts("[1-]").unwrap_err();
    assert_eq!((error.pos, error.msg), (3, "range end cannot be empty"));

    let error = parse_hosts("[]").unwrap_err();
    assert_eq!((error.pos, error.msg), (1, "empty group"));

    let error = parse_hosts("[a2-3]").unwrap_err();
    assert_eq!((error.pos, error.msg), (1, "range start is not a number"));
}

#[test]
pub fn unterminated_input_is_rejected() {
    let error = parse_hosts("h[1-2").unwrap_err();
    assert_eq!(error.msg, "unclosed group");

    let error = parse_hosts("h1-").unwrap_err();
    assert_eq!(error.msg, "range end cannot be empty");
}

#[test]
pub fn pretty_errors_annotate_the_source() {
    let error = parse_hosts("[a2-3]").unwrap_err();
    assert_eq!(
        error.pretty(),
        "invalid hosts list at character 1: range start is not a number\n  [a2-3]\n   ^"
    );
}

#[test]
pub fn node_lists_render_as_mpirun_host_selections() {
    let list = NodeList(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    assert_eq!(list.to_string(), "-hosts a,b,c");
    assert_eq!(NodeList::default().to_string(), "");
}

#[test]
pub fn allocation_is_all_or_nothing() {
    let pool = NodePool::parse("n[1-3]").unwrap();
    assert_eq!(pool.len(), 3);

    let first = pool.find_free(2).unwrap();
    assert_eq!(first.0, vec!["n1", "n2"]);
    assert_eq!(pool.free_count(), 1);

    // only one node left, the failed request must not touch the pool
    assert!(pool.find_free(2).is_none());
    assert_eq!(pool.free_count(), 1);

    let second = pool.find_free(1).unwrap();
    assert_eq!(second.0, vec!["n3"]);
    assert_eq!(pool.free_count(), 0);
}

#[test]
pub fn seen_nodes_are_scanned_in_name_order() {
    let pool = NodePool::new(["b", "a", "c"].map(String::from));
    let picked = pool.find_free(2).unwrap();
    assert_eq!(picked.0, vec!["a", "b"]);
}

#[test]
pub fn disposal_is_idempotent() {
    let pool = NodePool::parse("n[1-2]").unwrap();
    let picked = pool.find_free(2).unwrap();
    assert_eq!(pool.free_count(), 0);

    pool.dispose(&picked);
    assert_eq!(pool.free_count(), 2);
    pool.dispose(&picked);
    assert_eq!(pool.free_count(), 2);

    // unknown nodes are ignored
    pool.dispose(&NodeList(vec!["stranger".to_string()]));
    assert_eq!(pool.free_count(), 2);
}
