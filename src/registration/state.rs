/// 注册状态
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationState {
    Initial,
    Registered,
    Unregistered,
    Terminated,
}

impl RegistrationState {
    /// 合法的状态迁移
    ///
    /// ```text
    /// Initial      -> Registered | Unregistered
    /// Registered   -> Unregistered
    /// Unregistered -> Registered | Terminated
    /// ```
    ///
    /// `Initial -> Unregistered` 对应首次注册失败或尚未注册就注销。
    /// `Terminated` 之后不允许任何迁移。
    pub fn can_transition_to(self, next: RegistrationState) -> bool {
        use RegistrationState::*;
        matches!(
            (self, next),
            (Initial, Registered)
                | (Initial, Unregistered)
                | (Registered, Unregistered)
                | (Unregistered, Registered)
                | (Unregistered, Terminated)
        )
    }

    pub fn is_registered(self) -> bool {
        self == RegistrationState::Registered
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegistrationState::Initial => "Initial",
            RegistrationState::Registered => "Registered",
            RegistrationState::Unregistered => "Unregistered",
            RegistrationState::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
