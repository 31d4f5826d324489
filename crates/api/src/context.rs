use billflow_core::UserId;

/// Acting user for a request.
///
/// Taken from the optional `x-user-id` header. Authentication happens in front
/// of this service; requests without the header are recorded as system actions.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ActorContext {
    user_id: Option<UserId>,
}

impl ActorContext {
    pub fn new(user_id: Option<UserId>) -> Self {
        Self { user_id }
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }
}
