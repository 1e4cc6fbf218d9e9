//! Saved script persistence port.

use crate::domain::error::QuantscriptError;
use crate::domain::script::{NewScript, ScriptLookup, ScriptUpdate, StoredScript};

pub trait ScriptPort: Send + Sync {
    fn get_script(&self, id: i64) -> Result<Option<StoredScript>, QuantscriptError>;

    /// Resolves every id in `ids`; `missing` keeps the order of `ids`.
    fn get_scripts(&self, ids: &[i64]) -> Result<ScriptLookup, QuantscriptError>;

    fn create_script(&self, script: &NewScript) -> Result<StoredScript, QuantscriptError>;

    /// All scripts, newest first.
    fn list_scripts(&self) -> Result<Vec<StoredScript>, QuantscriptError>;

    /// Applies `update`; `None` when no script has this id.
    fn update_script(
        &self,
        id: i64,
        update: &ScriptUpdate,
    ) -> Result<Option<StoredScript>, QuantscriptError>;

    /// `true` when a script was deleted.
    fn delete_script(&self, id: i64) -> Result<bool, QuantscriptError>;
}
