use crate::errors::ToolError;
use crate::managers::api::ApiManager;
use crate::managers::ToolHandler;
use crate::services::executor::RequestExecutor;
use crate::services::logger::Logger;
use crate::services::registry::ConfigRegistry;
use crate::services::secrets::EnvSecretSource;
use crate::services::security::SecurityGuard;
use crate::services::storage::SessionStore;
use crate::services::validation::Validation;
use crate::utils::paths::{resolve_config_path, resolve_sessions_dir};
use std::collections::HashMap;
use std::sync::Arc;

pub struct App {
    pub logger: Logger,
    pub handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl App {
    pub fn initialize() -> Result<Self, ToolError> {
        let logger = Logger::new("apilink");
        let validation = Validation::new();

        let secrets = Arc::new(EnvSecretSource);
        let registry = Arc::new(ConfigRegistry::new(
            logger.clone(),
            resolve_config_path(),
            secrets,
        )?);
        let guard = Arc::new(SecurityGuard::new(logger.clone()));
        let executor = Arc::new(RequestExecutor::new(logger.clone(), guard)?);
        let sessions = Arc::new(SessionStore::new(logger.clone(), resolve_sessions_dir())?);

        let api_manager = Arc::new(ApiManager::new(
            logger.clone(),
            validation,
            registry,
            executor,
            sessions,
        ));

        let mut handlers: HashMap<String, Arc<dyn ToolHandler>> = HashMap::new();
        handlers.insert("api_connect".to_string(), api_manager);

        Ok(Self { logger, handlers })
    }
}
