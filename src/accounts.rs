// ===============================
// src/accounts.rs (user <-> sub account registry)
// ===============================
use std::collections::BTreeMap;

use ahash::AHashMap as HashMap;

use crate::domain::{AccountId, UserId, UserSubAccount};

#[derive(Debug, Default)]
pub struct AccountDirectory {
    // BTreeMap: urutan user deterministik saat fan-out
    user_accs: BTreeMap<UserId, Vec<AccountId>>,
    names: HashMap<AccountId, String>,
}

impl AccountDirectory {
    pub fn new() -> Self { Self::default() }

    /// Apply a `user_sub_account` record. The account name is always refreshed.
    pub fn apply(&mut self, rec: &UserSubAccount) {
        self.names.insert(rec.acc, rec.acc_name.clone());
        let accs = self.user_accs.entry(rec.user_id).or_default();
        let idx = accs.iter().position(|a| *a == rec.acc);
        if rec.action.as_deref() == Some("delete") {
            if let Some(i) = idx {
                accs.remove(i);
            }
        } else if idx.is_none() {
            accs.push(rec.acc);
        }
    }

    pub fn name(&self, acc: AccountId) -> &str {
        self.names.get(&acc).map(String::as_str).unwrap_or("")
    }

    pub fn accounts_of(&self, user: UserId) -> &[AccountId] {
        self.user_accs.get(&user).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn users(&self) -> impl Iterator<Item = (UserId, &[AccountId])> {
        self.user_accs.iter().map(|(u, a)| (*u, a.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(user_id: UserId, acc: AccountId, name: &str, action: Option<&str>) -> UserSubAccount {
        UserSubAccount { user_id, acc, acc_name: name.into(), action: action.map(Into::into) }
    }

    #[test]
    fn associate_rename_and_delete() {
        let mut d = AccountDirectory::new();
        d.apply(&rec(1, 10, "Desk1", None));
        d.apply(&rec(1, 11, "Desk2", None));
        d.apply(&rec(1, 10, "Desk1-renamed", None));
        assert_eq!(d.accounts_of(1), &[10, 11]);
        assert_eq!(d.name(10), "Desk1-renamed");

        d.apply(&rec(1, 10, "Desk1-renamed", Some("delete")));
        assert_eq!(d.accounts_of(1), &[11]);
        assert_eq!(d.accounts_of(2), &[] as &[AccountId]);
        assert_eq!(d.name(404), "");
    }
}
