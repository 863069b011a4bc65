/// Registration 模块
///
/// - `RegistrationState`: 注册状态及合法迁移
/// - `RegistrationManager`: 在信令连接上注册/注销，断线后自动重新注册

mod manager;
mod state;

pub use manager::RegistrationManager;
pub use state::RegistrationState;
