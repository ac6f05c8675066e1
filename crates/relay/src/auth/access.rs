// Picture access checks for the editing endpoint.
//
// Pictures either live in the public gallery (no space) or inside a space.
// Only team spaces are collaborative; their members get view or edit rights
// from their space role. Public pictures are editable by platform admins and
// viewable by everyone else.

use std::{collections::HashMap, sync::Arc};

use picsync_common::types::{PictureId, UserId};
use thiserror::Error;
use tokio::sync::RwLock;

use super::jwt::UserIdentity;

pub type SpaceId = i64;

/// What a caller may do with a picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PictureAccess {
    Denied,
    View,
    Edit,
}

impl PictureAccess {
    pub fn can_join(self) -> bool {
        self >= Self::View
    }

    pub fn can_edit(self) -> bool {
        self == Self::Edit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceType {
    Private,
    Team,
}

impl SpaceType {
    fn from_db_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Private),
            1 => Some(Self::Team),
            _ => None,
        }
    }
}

/// Role of a member inside a team space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceRole {
    Viewer,
    Editor,
    Admin,
}

impl SpaceRole {
    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "viewer" => Some(Self::Viewer),
            "editor" => Some(Self::Editor),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// The facts about a picture that decide access for one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureScope {
    pub space: Option<(SpaceId, SpaceType)>,
    pub member_role: Option<SpaceRole>,
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("picture {0} not found")]
    PictureNotFound(PictureId),
    #[error("picture {picture_id} references missing space {space_id}")]
    MissingSpace { picture_id: PictureId, space_id: SpaceId },
    #[error("invalid {field} value '{value}' in database")]
    InvalidValue { field: &'static str, value: String },
    #[error("failed to query picture access")]
    Database(#[from] sqlx::Error),
}

pub fn resolve_access(scope: PictureScope, identity: &UserIdentity) -> PictureAccess {
    match scope.space {
        None if identity.is_admin() => PictureAccess::Edit,
        None => PictureAccess::View,
        Some((_, SpaceType::Private)) => PictureAccess::Denied,
        Some((_, SpaceType::Team)) => match scope.member_role {
            Some(SpaceRole::Editor | SpaceRole::Admin) => PictureAccess::Edit,
            Some(SpaceRole::Viewer) => PictureAccess::View,
            None => PictureAccess::Denied,
        },
    }
}

#[derive(Debug, Default)]
pub struct MemoryAccessState {
    /// Picture id to owning space (`None` for the public gallery).
    pictures: HashMap<PictureId, Option<SpaceId>>,
    spaces: HashMap<SpaceId, SpaceType>,
    members: HashMap<(SpaceId, UserId), SpaceRole>,
}

#[derive(Debug, Clone)]
pub enum PictureAccessStore {
    Postgres(sqlx::PgPool),
    Memory(Arc<RwLock<MemoryAccessState>>),
}

impl PictureAccessStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryAccessState::default())))
    }

    pub async fn access_for(
        &self,
        picture_id: PictureId,
        identity: &UserIdentity,
    ) -> Result<PictureAccess, AccessError> {
        let scope = self.scope_for(picture_id, identity.user_id).await?;
        Ok(resolve_access(scope, identity))
    }

    async fn scope_for(
        &self,
        picture_id: PictureId,
        user_id: UserId,
    ) -> Result<PictureScope, AccessError> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, (Option<i64>, Option<i32>, Option<String>)>(
                    r#"
                    SELECT p.space_id, s.space_type, su.space_role
                    FROM picture AS p
                    LEFT JOIN space AS s
                        ON s.id = p.space_id
                       AND s.is_delete = 0
                    LEFT JOIN space_user AS su
                        ON su.space_id = p.space_id
                       AND su.user_id = $2
                    WHERE p.id = $1
                      AND p.is_delete = 0
                    "#,
                )
                .bind(picture_id)
                .bind(user_id)
                .fetch_optional(pool)
                .await?
                .ok_or(AccessError::PictureNotFound(picture_id))?;

                let (space_id, space_type, space_role) = row;
                let space = match (space_id, space_type) {
                    (None, _) => None,
                    (Some(space_id), None) => {
                        return Err(AccessError::MissingSpace { picture_id, space_id });
                    }
                    (Some(space_id), Some(space_type)) => {
                        let space_type = SpaceType::from_db_value(space_type).ok_or_else(|| {
                            AccessError::InvalidValue {
                                field: "space_type",
                                value: space_type.to_string(),
                            }
                        })?;
                        Some((space_id, space_type))
                    }
                };
                let member_role = space_role
                    .map(|role| {
                        SpaceRole::from_db_value(&role)
                            .ok_or(AccessError::InvalidValue { field: "space_role", value: role })
                    })
                    .transpose()?;

                Ok(PictureScope { space, member_role })
            }
            Self::Memory(state) => {
                let state = state.read().await;
                let space_id = *state
                    .pictures
                    .get(&picture_id)
                    .ok_or(AccessError::PictureNotFound(picture_id))?;
                let space = match space_id {
                    None => None,
                    Some(space_id) => {
                        let space_type = *state
                            .spaces
                            .get(&space_id)
                            .ok_or(AccessError::MissingSpace { picture_id, space_id })?;
                        Some((space_id, space_type))
                    }
                };
                let member_role = space_id
                    .and_then(|space_id| state.members.get(&(space_id, user_id)).copied());

                Ok(PictureScope { space, member_role })
            }
        }
    }

    /// Registers a public-gallery picture in the in-memory store.
    pub async fn insert_public_picture(&self, picture_id: PictureId) {
        if let Self::Memory(state) = self {
            state.write().await.pictures.insert(picture_id, None);
        }
    }

    /// Registers a picture inside a space in the in-memory store.
    pub async fn insert_space_picture(
        &self,
        picture_id: PictureId,
        space_id: SpaceId,
        space_type: SpaceType,
    ) {
        if let Self::Memory(state) = self {
            let mut state = state.write().await;
            state.spaces.insert(space_id, space_type);
            state.pictures.insert(picture_id, Some(space_id));
        }
    }

    pub async fn grant_space_role(&self, space_id: SpaceId, user_id: UserId, role: SpaceRole) {
        if let Self::Memory(state) = self {
            state.write().await.members.insert((space_id, user_id), role);
        }
    }
}
