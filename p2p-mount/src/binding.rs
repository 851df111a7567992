use crate::{ForwardBinding, ListenBinding, ListenerInfo, Role, StreamInfo};

/// A registered protocol, in either direction.
pub enum Binding {
    Listen(ListenBinding),
    Forward(ForwardBinding),
}

impl Binding {
    pub fn protocol(&self) -> &str {
        match self {
            Binding::Listen(b) => b.protocol(),
            Binding::Forward(b) => b.protocol(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Binding::Listen(_) => Role::Listen,
            Binding::Forward(_) => Role::Forward,
        }
    }

    pub fn listener_info(&self) -> ListenerInfo {
        match self {
            Binding::Listen(b) => b.info(),
            Binding::Forward(b) => b.info(),
        }
    }

    pub fn sessions(&self) -> Vec<StreamInfo> {
        match self {
            Binding::Listen(b) => b.sessions(),
            Binding::Forward(b) => b.sessions(),
        }
    }

    pub async fn close(&self) {
        match self {
            Binding::Listen(b) => b.close().await,
            Binding::Forward(b) => b.close().await,
        }
    }
}

impl From<ListenBinding> for Binding {
    fn from(b: ListenBinding) -> Self {
        Binding::Listen(b)
    }
}

impl From<ForwardBinding> for Binding {
    fn from(b: ForwardBinding) -> Self {
        Binding::Forward(b)
    }
}
