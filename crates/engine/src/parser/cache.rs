// ABOUTME: Per-source-name cache of SourceParser instances shared by the engine operations.
// ABOUTME: An entry is rebuilt when the stored definition's rules no longer match the cached one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::parser::{ParserSettings, SourceParser};
use crate::resource::Fetcher;
use crate::source::SourceDefinition;

pub struct ParserCache {
    fetcher: Arc<Fetcher>,
    settings: ParserSettings,
    parsers: RwLock<HashMap<String, Arc<SourceParser>>>,
}

impl ParserCache {
    pub fn new(fetcher: Arc<Fetcher>, settings: ParserSettings) -> Self {
        Self {
            fetcher,
            settings,
            parsers: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the parser for `def`, building a fresh one if the rules changed.
    pub fn get(&self, def: &SourceDefinition) -> Arc<SourceParser> {
        if let Ok(parsers) = self.parsers.read() {
            if let Some(parser) = parsers.get(&def.name) {
                if parser.definition().same_rules(def) {
                    return Arc::clone(parser);
                }
            }
        }

        let parser = Arc::new(SourceParser::new(
            def.clone(),
            Arc::clone(&self.fetcher),
            self.settings.clone(),
        ));
        if let Ok(mut parsers) = self.parsers.write() {
            parsers.insert(def.name.clone(), Arc::clone(&parser));
        }
        parser
    }

    /// Drops the cached parser for `name`, if any.
    pub fn invalidate(&self, name: &str) {
        if let Ok(mut parsers) = self.parsers.write() {
            parsers.remove(name);
        }
    }

    pub fn len(&self) -> usize {
        self.parsers.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{DnsMode, EngineOptions};

    fn cache() -> ParserCache {
        let opts = EngineOptions {
            dns: DnsMode::System,
            ..EngineOptions::default()
        };
        ParserCache::new(
            Arc::new(Fetcher::new(&opts).unwrap()),
            ParserSettings::default(),
        )
    }

    #[test]
    fn same_definition_reuses_parser() {
        let cache = cache();
        let def = SourceDefinition::new("A", "https://a.example/");
        let first = cache.get(&def);
        let mut used = def.clone();
        used.stats.count = 5;
        let second = cache.get(&used);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn changed_rules_rebuild_parser() {
        let cache = cache();
        let mut def = SourceDefinition::new("A", "https://a.example/");
        let first = cache.get(&def);
        def.search.list = Some("li".into());
        let second = cache.get(&def);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.definition().search.list.as_deref(), Some("li"));

        cache.invalidate("A");
        assert!(cache.is_empty());
    }
}
