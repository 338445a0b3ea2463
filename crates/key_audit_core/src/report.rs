use crate::contract::{AccessKeyRecord, UserKeyGroup};

/// Partitions a discovery-ordered key list into per-user groups. Group order
/// follows each user's first appearance; within a group, keys keep discovery
/// order. Users without keys in the input produce no group.
pub fn group_keys_by_user(keys: Vec<AccessKeyRecord>) -> Vec<UserKeyGroup> {
    let mut groups: Vec<UserKeyGroup> = Vec::new();

    for key in keys {
        match groups
            .iter_mut()
            .find(|group| group.user_name == key.user_name)
        {
            Some(group) => group.keys.push(key),
            None => groups.push(UserKeyGroup {
                user_name: key.user_name.clone(),
                keys: vec![key],
            }),
        }
    }

    groups
}

pub fn describe_key(key: &AccessKeyRecord) -> String {
    format!(
        "user={} access_key_id={} status={} created_at={}",
        key.user_name,
        key.access_key_id.as_deref().unwrap_or("unknown"),
        key.status.as_str(),
        key.created_at.to_rfc3339(),
    )
}

/// One notification body per user group: one line per stale key.
pub fn format_group_message(group: &UserKeyGroup) -> String {
    group
        .keys
        .iter()
        .map(describe_key)
        .collect::<Vec<_>>()
        .join("\n")
}
