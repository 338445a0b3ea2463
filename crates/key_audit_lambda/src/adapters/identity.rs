use key_audit_core::contract::{AccessKeyRecord, UserRecord};

/// One page of the user listing. `has_more` with a missing `next_token` is
/// malformed paging state and aborts the enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPage {
    pub users: Vec<UserRecord>,
    pub has_more: bool,
    pub next_token: Option<String>,
}

pub trait IdentityDirectory {
    fn list_users_page(&self, continuation_token: Option<&str>) -> Result<UserPage, String>;

    /// Full access-key list for one user. Implementations over paginating
    /// services must loop internally and return the merged list.
    fn list_access_keys(&self, user_name: &str) -> Result<Vec<AccessKeyRecord>, String>;
}
