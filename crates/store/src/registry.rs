use crate::action::{self, Action};
use crate::error::{Result, StoreError};
use loupe_protocol::ActionData;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub type ActionCreator = Arc<dyn Fn(&ActionData) -> Result<Arc<dyn Action>> + Send + Sync>;

/// Name → factory map used to decode client actions.
#[derive(Default)]
pub struct ActionRegistry {
    creators: RwLock<HashMap<String, ActionCreator>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every action an editor may send.
    pub fn with_builtins() -> Self {
        let reg = Self::new();
        reg.register("QueryCompletions", action::QueryCompletions);
        reg.register("QueryIssues", action::QueryIssues);
        reg.register("QueryUserCmds", action::QueryUserCmds);
        reg.register("Restart", action::Restart);
        reg.register("Shutdown", action::Shutdown);
        reg.register("ViewActivated", action::ViewActivated);
        reg.register("ViewFmt", action::ViewFmt);
        reg.register("ViewLoaded", action::ViewLoaded);
        reg.register("ViewModified", action::ViewModified);
        reg.register("ViewPosChanged", action::ViewPosChanged);
        reg.register("ViewPreSave", action::ViewPreSave);
        reg.register("ViewSaved", action::ViewSaved);
        reg.register("RunCmd", action::RunCmd::default());
        reg
    }

    /// Installs a factory producing copies of `zero`, decoded from the
    /// request's data when it is non-empty.
    ///
    /// # Panics
    ///
    /// Registering the same name twice is a programming error and panics.
    pub fn register<A>(&self, name: &str, zero: A)
    where
        A: Action + Clone + DeserializeOwned,
    {
        if let Err(err) = self.try_register(name, zero) {
            panic!("{err}");
        }
    }

    pub fn try_register<A>(&self, name: &str, zero: A) -> Result<()>
    where
        A: Action + Clone + DeserializeOwned,
    {
        let mut creators = self.creators.write().unwrap_or_else(|e| e.into_inner());
        if creators.contains_key(name) {
            return Err(StoreError::AlreadyRegistered(name.to_string()));
        }
        let label = name.to_string();
        let creator: ActionCreator = Arc::new(move |data: &ActionData| {
            if data.is_empty() {
                return Ok(Arc::new(zero.clone()) as Arc<dyn Action>);
            }
            let act: A = data.decode().map_err(|source| StoreError::Decode {
                action: label.clone(),
                source,
            })?;
            Ok(Arc::new(act) as Arc<dyn Action>)
        });
        creators.insert(name.to_string(), creator);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<ActionCreator> {
        self.creators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn create(&self, name: &str, data: &ActionData) -> Result<Arc<dyn Action>> {
        let creator = self
            .lookup(name)
            .ok_or_else(|| StoreError::UnknownAction(name.to_string()))?;
        creator(data)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .creators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::RunCmd;
    use loupe_protocol::Codec;
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Hello {
        msg: String,
    }
    crate::action!(Hello);

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Other;
    crate::action!(Other);

    #[test]
    #[should_panic(expected = "ActionCreator hello is already registered")]
    fn registering_a_name_twice_panics() {
        let reg = ActionRegistry::new();
        reg.register("hello", Hello::default());
        reg.register("hello", Other);
    }

    #[test]
    fn try_register_reports_collisions() {
        let reg = ActionRegistry::new();
        reg.try_register("hello", Hello::default()).unwrap();
        assert!(matches!(
            reg.try_register("hello", Other),
            Err(StoreError::AlreadyRegistered(name)) if name == "hello"
        ));
    }

    #[test]
    fn empty_data_yields_the_zero_value() {
        let reg = ActionRegistry::new();
        reg.register(
            "hello",
            Hello {
                msg: "zero".into(),
            },
        );
        let act = reg.create("hello", &ActionData::empty(Codec::Json)).unwrap();
        assert_eq!(act.downcast_ref::<Hello>().unwrap().msg, "zero");
    }

    #[test]
    fn data_is_decoded_with_the_request_codec() {
        let reg = ActionRegistry::with_builtins();
        for codec in Codec::ALL {
            let data = ActionData::encode(
                codec,
                &RunCmd {
                    name: "go".into(),
                    args: vec!["test".into()],
                    input: false,
                },
            )
            .unwrap();
            let act = reg.create("RunCmd", &data).unwrap();
            let cmd = act.downcast_ref::<RunCmd>().expect("RunCmd");
            assert_eq!(cmd.args, vec!["test".to_string()], "{codec}");
        }
    }

    #[test]
    fn unknown_names_are_reported() {
        let reg = ActionRegistry::with_builtins();
        assert!(matches!(
            reg.create("Nope", &ActionData::default()),
            Err(StoreError::UnknownAction(_))
        ));
        assert!(reg.names().contains(&"ViewSaved".to_string()));
        assert!(!reg.names().contains(&"Started".to_string()));
    }
}
