use crate::utils::{double_sha256_hex, sha256_hex};

/// Merkle root over hex-encoded transaction ids.
///
/// Nodes are combined by double SHA-256 of the two hex strings concatenated,
/// and odd levels duplicate their last element. An empty list hashes the empty
/// string and a single id is its own root.
pub fn merkle_root(hashes: &[String]) -> String {
    match hashes.len() {
        0 => sha256_hex(b""),
        1 => hashes[0].clone(),
        _ => merkle_root(&next_level(hashes)),
    }
}

fn combine(left: &str, right: &str) -> String {
    let mut joined = String::with_capacity(left.len() + right.len());
    joined.push_str(left);
    joined.push_str(right);
    double_sha256_hex(joined.as_bytes())
}

fn next_level(level: &[String]) -> Vec<String> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => combine(left, right),
            [last] => combine(last, last),
            _ => unreachable!("chunks(2) yields one or two elements"),
        })
        .collect()
}
