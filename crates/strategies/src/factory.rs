//! Strategy registry: maps a bot's persisted `strategy_type` to a
//! constructor. Adding a strategy means implementing [`crate::Strategy`]
//! and registering its constructor here.

use crate::error::StrategyError;
use crate::grid::GridStrategy;
use crate::{Strategy, StrategyServices};
use api_client::ExchangeApi;
use configuration::GridParameters;
use core_types::{BotConfig, StrategyType};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type StrategyCtor = fn(
    BotConfig,
    Arc<dyn ExchangeApi>,
    StrategyServices,
    &Path,
) -> Result<Arc<dyn Strategy>, StrategyError>;

pub struct StrategyRegistry {
    ctors: HashMap<StrategyType, StrategyCtor>,
    state_dir: PathBuf,
}

fn build_grid_strategy(
    config: BotConfig,
    client: Arc<dyn ExchangeApi>,
    services: StrategyServices,
    state_dir: &Path,
) -> Result<Arc<dyn Strategy>, StrategyError> {
    let params = GridParameters::from_parameters(&config.parameters)?;
    Ok(GridStrategy::new(config, params, client, services, state_dir))
}

impl StrategyRegistry {
    /// Registry with the built-in strategies registered.
    pub fn with_defaults(state_dir: PathBuf) -> Self {
        let mut registry = Self {
            ctors: HashMap::new(),
            state_dir,
        };
        registry.register(StrategyType::Grid, build_grid_strategy);
        registry
    }

    pub fn register(&mut self, strategy_type: StrategyType, ctor: StrategyCtor) {
        self.ctors.insert(strategy_type, ctor);
    }

    /// Constructs the strategy for a bot, or fails when its type has no
    /// registered implementation.
    pub fn create(
        &self,
        config: BotConfig,
        client: Arc<dyn ExchangeApi>,
        services: StrategyServices,
    ) -> Result<Arc<dyn Strategy>, StrategyError> {
        let strategy_type = config.strategy_type;
        let ctor = self
            .ctors
            .get(&strategy_type)
            .ok_or(StrategyError::UnsupportedStrategy(strategy_type))?;
        ctor(config, client, services, &self.state_dir)
    }
}
