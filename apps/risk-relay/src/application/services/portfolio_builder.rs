//! Portfolio Builder
//!
//! Compiles a risk file's config tree into a `Portfolio`:
//!
//! ```text
//! accounts = 101, 102          # optional account restriction
//! filter = Type == 'CS'        # optional bool predicate per position
//!
//! [Exposure]                   # one risk definition per depth-1 section
//! gross = sum(abs(Pos * Close))
//! top5 = top(Pos * Close, 5)
//! graph = gross                # params that keep history
//! ```
//!
//! `call(...)` params are dry-run through the script runtime so a broken
//! module is reported when the file is saved, not on the next tick.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::application::ports::{FileStore, ScriptRuntime};
use crate::domain::config_tree::{ConfigSection, ConfigTree};
use crate::domain::expression::{Expression, ExpressionBody, ExpressionError, ValueKind};
use crate::domain::market::{AccountId, UserId};
use crate::domain::portfolio::{
    Portfolio, PortfolioError, RiskDefinition, RiskParam, portfolio_name,
};

const ACCOUNTS_KEY: &str = "accounts";
const FILTER_KEY: &str = "filter";
const GRAPH_KEY: &str = "graph";

/// Builds portfolios from risk files.
#[derive(Clone)]
pub struct PortfolioBuilder {
    scripts: Arc<dyn ScriptRuntime>,
    files: Arc<dyn FileStore>,
}

impl std::fmt::Debug for PortfolioBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortfolioBuilder").finish_non_exhaustive()
    }
}

impl PortfolioBuilder {
    /// Create a builder.
    #[must_use]
    pub fn new(scripts: Arc<dyn ScriptRuntime>, files: Arc<dyn FileStore>) -> Self {
        Self { scripts, files }
    }

    /// Parse and compile a `<name>.ini` file for `user`.
    ///
    /// # Errors
    ///
    /// Returns `PortfolioError` if the file name is not a portfolio name,
    /// the text is not a valid config tree, or compilation fails.
    pub async fn build_file(
        &self,
        user: UserId,
        file_name: &str,
        text: &str,
    ) -> Result<Portfolio, PortfolioError> {
        let name = portfolio_name(file_name).ok_or_else(|| PortfolioError::Structure {
            line: 0,
            reason: format!("'{file_name}' is not a portfolio file"),
        })?;
        let tree = ConfigTree::parse(text)?;
        self.build(user, name, &tree).await
    }

    /// Compile a parsed tree.
    ///
    /// # Errors
    ///
    /// Returns `PortfolioError` on malformed accounts, nested risk sections,
    /// unknown graph params, or a formula that fails to compile.
    pub async fn build(
        &self,
        user: UserId,
        name: &str,
        tree: &ConfigTree,
    ) -> Result<Portfolio, PortfolioError> {
        let root = tree.root();

        let accounts = match root.get(ACCOUNTS_KEY) {
            Some(value) => Some(parse_accounts(&value.value, value.line)?),
            None => None,
        };

        let filter = match root.get(FILTER_KEY) {
            Some(value) => Some(Expression::compile(
                FILTER_KEY,
                value.line,
                &value.value,
                ValueKind::Bool,
            )?),
            None => None,
        };

        let mut risks = Vec::with_capacity(root.sections().len());
        for section in root.sections() {
            risks.push(self.build_risk(user, section).await?);
        }

        Ok(Portfolio {
            name: name.to_string(),
            accounts,
            filter,
            risks,
        })
    }

    async fn build_risk(
        &self,
        user: UserId,
        section: &ConfigSection,
    ) -> Result<RiskDefinition, PortfolioError> {
        if let Some(nested) = section.sections().first() {
            return Err(PortfolioError::Structure {
                line: nested.line(),
                reason: format!("risk section '{}' cannot be nested", nested.name()),
            });
        }

        let graph: BTreeSet<&str> = section
            .get(GRAPH_KEY)
            .map(|v| split_list(&v.value).collect())
            .unwrap_or_default();

        let mut params = Vec::with_capacity(section.values().len());
        for value in section.values().iter().filter(|v| v.key != GRAPH_KEY) {
            let expression =
                Expression::compile(&value.key, value.line, &value.value, ValueKind::Number)?;

            if let ExpressionBody::Call(spec) = expression.body() {
                let dir = self.files.user_dir(user);
                self.scripts.call(spec, &dir).await.map_err(|e| {
                    ExpressionError::invalid(&value.key, value.line, &value.value, e)
                })?;
            }

            let is_graph = graph.contains(value.key.as_str());
            params.push(RiskParam::new(value.key.clone(), expression, is_graph));
        }

        if let Some(graph_value) = section.get(GRAPH_KEY)
            && let Some(unknown) = graph
                .iter()
                .find(|name| !params.iter().any(|p| p.name() == **name))
        {
            return Err(PortfolioError::Structure {
                line: graph_value.line,
                reason: format!("unknown graph parameter '{unknown}'"),
            });
        }

        Ok(RiskDefinition {
            name: section.name().to_string(),
            params,
        })
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_accounts(value: &str, line: usize) -> Result<BTreeSet<AccountId>, PortfolioError> {
    split_list(value)
        .map(|s| {
            s.parse::<AccountId>().map_err(|_| PortfolioError::Structure {
                line,
                reason: format!("bad account id '{s}'"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::application::ports::{CallValue, MockFileStore, MockScriptRuntime, ScriptError};

    fn builder(scripts: MockScriptRuntime) -> PortfolioBuilder {
        let mut files = MockFileStore::new();
        files
            .expect_user_dir()
            .returning(|user| PathBuf::from(format!("/tmp/store/{user}")));
        PortfolioBuilder::new(Arc::new(scripts), Arc::new(files))
    }

    #[tokio::test]
    async fn builds_risks_in_file_order() {
        let text = "accounts = 1, 2\nfilter = Pos != 0\n[Exposure]\ngross = sum(abs(Pos * Close))\nnet = sum(Pos * Close)\ngraph = net\n[Names]\nbig = top(Pos, 3)\n";
        let portfolio = builder(MockScriptRuntime::new())
            .build_file(0, "main.ini", text)
            .await
            .unwrap();

        assert_eq!(portfolio.name, "main");
        assert_eq!(portfolio.accounts, Some(BTreeSet::from([1, 2])));
        assert!(portfolio.filter.is_some());
        let names: Vec<_> = portfolio.risks.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Exposure", "Names"]);

        let exposure = portfolio.risk("Exposure").unwrap();
        assert_eq!(exposure.params.len(), 2);
        assert!(!exposure.param("gross").unwrap().is_graph());
        assert!(exposure.param("net").unwrap().is_graph());
    }

    #[tokio::test]
    async fn unknown_variable_reports_line_and_text() {
        let err = builder(MockScriptRuntime::new())
            .build_file(0, "a.ini", "[Sec]\nk=v\n")
            .await
            .unwrap_err();
        assert!(
            err.to_string()
                .starts_with("invalid k expression on line 2: v: ")
        );
    }

    #[tokio::test]
    async fn config_syntax_errors_surface() {
        let err = builder(MockScriptRuntime::new())
            .build_file(0, "a.ini", "[A]\n[[[B]]]\n")
            .await
            .unwrap_err();
        assert!(matches!(err, PortfolioError::Syntax(_)));
    }

    #[tokio::test]
    async fn nested_risk_sections_are_rejected() {
        let err = builder(MockScriptRuntime::new())
            .build_file(0, "a.ini", "[A]\nx = sum(Pos)\n[[B]]\ny = 1\n")
            .await
            .unwrap_err();
        assert!(matches!(err, PortfolioError::Structure { line: 3, .. }));
    }

    #[tokio::test]
    async fn unknown_graph_param_is_rejected() {
        let err = builder(MockScriptRuntime::new())
            .build_file(0, "a.ini", "[A]\nx = sum(Pos)\ngraph = x, y\n")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown graph parameter 'y'"));
    }

    #[tokio::test]
    async fn bad_accounts_are_rejected() {
        let err = builder(MockScriptRuntime::new())
            .build_file(0, "a.ini", "accounts = 1, x\n")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad account id 'x'"));
    }

    #[tokio::test]
    async fn non_portfolio_file_names_are_rejected() {
        let err = builder(MockScriptRuntime::new())
            .build_file(0, "a.txt", "")
            .await
            .unwrap_err();
        assert!(matches!(err, PortfolioError::Structure { .. }));
    }

    #[tokio::test]
    async fn call_params_are_dry_run_in_the_user_dir() {
        let mut scripts = MockScriptRuntime::new();
        scripts
            .expect_call()
            .withf(|spec, dir| spec.module == "m" && dir == PathBuf::from("/tmp/store/7"))
            .times(1)
            .returning(|_, _| Ok(CallValue::Number(1.0)));

        let portfolio = builder(scripts)
            .build_file(7, "a.ini", "[A]\nv = call('m', 'f')\n")
            .await
            .unwrap();
        assert_eq!(portfolio.risks[0].params.len(), 1);
    }

    #[tokio::test]
    async fn failing_dry_run_fails_compilation() {
        let mut scripts = MockScriptRuntime::new();
        scripts
            .expect_call()
            .returning(|_, _| Err(ScriptError::BadReturn));

        let err = builder(scripts)
            .build_file(7, "a.ini", "[A]\nv = call('m', 'f')\n")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid v expression on line 2: call('m', 'f'): it must return a float number or an name/value tuple list"
        );
    }
}
