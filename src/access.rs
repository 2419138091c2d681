//! View/edit gate
//!
//! The engine asks a yes/no question before feed reads and structural
//! changes. Policy lives in the implementation; `GroupMembershipGate` is the
//! membership rule used by the binary.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{EventSeries, Group, Hangout, ItemKey, Visibility};
use crate::store::{get_typed, ItemStore};

/// Entity a permission question is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    Group(String),
    Hangout(String),
    Series(String),
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityRef::Group(id) => write!(f, "group {}", id),
            EntityRef::Hangout(id) => write!(f, "hangout {}", id),
            EntityRef::Series(id) => write!(f, "series {}", id),
        }
    }
}

#[async_trait]
pub trait AccessGate: Send + Sync {
    async fn can_view(&self, user_id: &str, entity: &EntityRef) -> Result<bool>;

    async fn can_edit(&self, user_id: &str, entity: &EntityRef) -> Result<bool>;
}

/// Lets everyone do everything
pub struct AllowAll;

#[async_trait]
impl AccessGate for AllowAll {
    async fn can_view(&self, _user_id: &str, _entity: &EntityRef) -> Result<bool> {
        Ok(true)
    }

    async fn can_edit(&self, _user_id: &str, _entity: &EntityRef) -> Result<bool> {
        Ok(true)
    }
}

/// Members of a group may view and edit what belongs to it. Public groups
/// and public hangouts are viewable by anyone.
pub struct GroupMembershipGate {
    store: Arc<dyn ItemStore>,
}

impl GroupMembershipGate {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self { store }
    }

    async fn group(&self, group_id: &str) -> Result<Option<Group>> {
        Ok(get_typed::<Group>(self.store.as_ref(), &ItemKey::group(group_id))
            .await?
            .map(|g| g.value))
    }

    async fn member_of_any(&self, user_id: &str, group_ids: &[String]) -> Result<bool> {
        for group_id in group_ids {
            if let Some(group) = self.group(group_id).await? {
                if group.has_member(user_id) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Groups an entity belongs to, and whether it is public on its own
    async fn owning_groups(&self, entity: &EntityRef) -> Result<(Vec<String>, bool)> {
        let store = self.store.as_ref();
        match entity {
            EntityRef::Group(id) => {
                let public = self.group(id).await?.map_or(false, |g| g.public);
                Ok((vec![id.clone()], public))
            }
            EntityRef::Hangout(id) => match get_typed::<Hangout>(store, &ItemKey::hangout(id)).await? {
                Some(h) => Ok((h.value.associated_groups, h.value.visibility == Visibility::Public)),
                None => Ok((Vec::new(), false)),
            },
            EntityRef::Series(id) => match get_typed::<EventSeries>(store, &ItemKey::series(id)).await? {
                Some(s) => Ok((s.value.group_ids, false)),
                None => Ok((Vec::new(), false)),
            },
        }
    }
}

#[async_trait]
impl AccessGate for GroupMembershipGate {
    async fn can_view(&self, user_id: &str, entity: &EntityRef) -> Result<bool> {
        let (groups, public) = self.owning_groups(entity).await?;
        Ok(public || self.member_of_any(user_id, &groups).await?)
    }

    async fn can_edit(&self, user_id: &str, entity: &EntityRef) -> Result<bool> {
        let (groups, _) = self.owning_groups(entity).await?;
        self.member_of_any(user_id, &groups).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StoreItem;
    use crate::store::{Condition, MemoryStore};

    async fn store_with_group(public: bool) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .put(
                ItemKey::group("g1"),
                StoreItem::Group(Group {
                    group_id: "g1".into(),
                    group_name: "Climbers".into(),
                    member_ids: vec!["alice".into()],
                    public,
                    created_at: 0,
                }),
                Condition::NotExists,
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_membership_rules() {
        let gate = GroupMembershipGate::new(store_with_group(false).await);
        let group = EntityRef::Group("g1".into());

        assert!(gate.can_view("alice", &group).await.unwrap());
        assert!(gate.can_edit("alice", &group).await.unwrap());
        assert!(!gate.can_view("mallory", &group).await.unwrap());
        assert!(!gate.can_view("alice", &EntityRef::Group("nope".into())).await.unwrap());
    }

    #[tokio::test]
    async fn test_public_group_is_viewable_not_editable() {
        let gate = GroupMembershipGate::new(store_with_group(true).await);
        let group = EntityRef::Group("g1".into());
        assert!(gate.can_view("anyone", &group).await.unwrap());
        assert!(!gate.can_edit("anyone", &group).await.unwrap());
    }

    #[tokio::test]
    async fn test_allow_all() {
        assert!(AllowAll.can_edit("x", &EntityRef::Series("s".into())).await.unwrap());
    }
}
