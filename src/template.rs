// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Template engine adapter.
//!
//! Templates are rendered by [minijinja] and treated as a black box that
//! takes a function map plus a data document and produces bytes. On top of
//! the engine's builtins every template sees:
//!
//! - `include(path)`: contents of a file relative to the source directory.
//! - `include_template(name, data?)`: render a snippet from
//!   `.chezmoitemplates`.
//! - `fail(message)`: stop rendering with an error.
//! - `output(command, args...)`: standard output of a command.
//!
//! Callbacks report failure through their return value. A failing callback
//! aborts rendering of the current template and nothing else.
//!
//! # See Also
//!
//! - [minijinja](https://docs.rs/minijinja)

use crate::system::System;

use minijinja::{
    context, value::Rest, AutoEscape, Environment, Error as EngineError, ErrorKind, State,
    UndefinedBehavior, Value,
};
use std::{collections::BTreeMap, path::PathBuf, process::Command, sync::Arc};

/// Function callable from templates.
pub type TemplateFunc = Arc<dyn Fn(&[Value]) -> Result<Value, EngineError> + Send + Sync>;

/// Named template functions supplied by collaborators.
pub type FuncMap = BTreeMap<String, TemplateFunc>;

/// Engine knobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateOptions {
    /// Referencing an undefined variable is an error.
    pub strict: bool,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self { strict: true }
    }
}

/// Shared template engine.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    /// Construct new engine with the base functions that need no outside
    /// collaborators.
    pub fn new(options: &TemplateOptions) -> Self {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        if options.strict {
            env.set_undefined_behavior(UndefinedBehavior::Strict);
        }

        env.add_function("include_template", include_template);
        env.add_function("fail", fail);

        Self { env }
    }

    /// Register a named snippet for `include_template`.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Snippet`] if snippet does not parse.
    pub fn add_snippet(&mut self, name: impl Into<String>, source: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.env
            .add_template_owned(name.clone(), source.into())
            .map_err(|source| Error::Snippet { name, source })
    }

    /// Register a template function, replacing any of the same name.
    pub fn add_function(&mut self, name: impl Into<String>, func: TemplateFunc) {
        self.env
            .add_function(name.into(), move |args: Rest<Value>| func(&args.0));
    }

    /// Register every function of `funcs`.
    pub fn add_functions(&mut self, funcs: &FuncMap) {
        for (name, func) in funcs {
            self.add_function(name.clone(), func.clone());
        }
    }

    /// Render template source against data.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotUtf8`] if source is not UTF-8.
    /// - Return [`Error::Render`] if template fails to parse or render.
    pub fn execute(&self, name: &str, source: &[u8], data: &serde_json::Value) -> Result<Vec<u8>> {
        let source = std::str::from_utf8(source).map_err(|_| Error::NotUtf8 {
            name: name.to_string(),
        })?;

        self.env
            .render_named_str(name, source, data)
            .map(String::into_bytes)
            .map_err(|source| Error::Render {
                name: name.to_string(),
                source,
            })
    }
}

fn include_template(
    state: &State,
    name: String,
    data: Option<Value>,
) -> Result<String, EngineError> {
    let template = state.get_template(&name)?;
    match data {
        Some(data) => template.render(data),
        None => template.render(context! { chezmoi => state.lookup("chezmoi") }),
    }
}

fn fail(message: String) -> Result<Value, EngineError> {
    Err(EngineError::new(ErrorKind::InvalidOperation, message))
}

/// Build `include`, reading files relative to `source_dir` through `system`.
pub fn include_func(system: Arc<dyn System>, source_dir: PathBuf) -> TemplateFunc {
    Arc::new(move |args: &[Value]| {
        let [path] = args else {
            return Err(EngineError::new(
                ErrorKind::InvalidOperation,
                "include expects exactly one path",
            ));
        };
        let path = source_dir.join(path.as_str().unwrap_or_default());
        let data = system.read_file(&path).map_err(|error| {
            EngineError::new(ErrorKind::InvalidOperation, "include failed").with_source(error)
        })?;

        Ok(Value::from(String::from_utf8_lossy(&data).into_owned()))
    })
}

/// Build `output`, running commands through `system`.
pub fn output_func(system: Arc<dyn System>) -> TemplateFunc {
    Arc::new(move |args: &[Value]| {
        let Some((name, args)) = args.split_first() else {
            return Err(EngineError::new(
                ErrorKind::InvalidOperation,
                "output expects a command",
            ));
        };

        let mut cmd = Command::new(name.to_string());
        cmd.args(args.iter().map(ToString::to_string));
        let stdout = system.idempotent_cmd_output(&mut cmd).map_err(|error| {
            EngineError::new(ErrorKind::InvalidOperation, "output failed").with_source(error)
        })?;

        Ok(Value::from(String::from_utf8_lossy(&stdout).into_owned()))
    })
}

/// Template error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Snippet does not parse.
    #[error("invalid template snippet {name:?}")]
    Snippet {
        name: String,
        #[source]
        source: EngineError,
    },

    /// Template fails to parse or render.
    #[error("failed to render template {name:?}")]
    Render {
        name: String,
        #[source]
        source: EngineError,
    },

    /// Template source is not text.
    #[error("template {name:?} is not valid UTF-8")]
    NotUtf8 { name: String },
}

/// Friendly result alias :3
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::RealSystem;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn engine() -> TemplateEngine {
        TemplateEngine::new(&TemplateOptions::default())
    }

    #[test]
    fn renders_with_trailing_newline() {
        let result = engine().execute("dot_template.tmpl", b"{{ \"ok\" }}\n", &json!({}));
        assert_eq!(result.unwrap(), b"ok\n");
    }

    #[test]
    fn renders_data_without_escaping() {
        let data = json!({ "chezmoi": { "os": "linux" }, "email": "<me@example.com>" });
        let result = engine()
            .execute(
                "index.html.tmpl",
                indoc! {b"
                    os = {{ chezmoi.os }}
                    email = {{ email }}
                "},
                &data,
            )
            .unwrap();
        assert_eq!(
            String::from_utf8(result).unwrap(),
            indoc! {"
                os = linux
                email = <me@example.com>
            "}
        );
    }

    #[test]
    fn undefined_variable_is_error() {
        let result = engine().execute("t", b"{{ nope }}", &json!({}));
        assert!(matches!(result, Err(Error::Render { .. })));
    }

    #[test]
    fn fail_returns_error() {
        let result = engine().execute("t", b"a{{ fail(\"boom\") }}b", &json!({}));
        let Err(Error::Render { source, .. }) = result else {
            panic!("expected render error");
        };
        assert!(source.to_string().contains("boom"));
    }

    #[test]
    fn include_template_renders_snippet() {
        let mut engine = engine();
        engine.add_snippet("greeting", "hello {{ name }}").unwrap();
        let result = engine
            .execute("t", b"{{ include_template(\"greeting\", {\"name\": \"world\"}) }}", &json!({}))
            .unwrap();
        assert_eq!(result, b"hello world");

        let result = engine.execute("t", b"{{ include_template(\"missing\") }}", &json!({}));
        assert!(result.is_err());
    }

    #[test]
    fn collaborator_functions() {
        let mut engine = engine();
        let mut funcs = FuncMap::new();
        funcs.insert(
            "shout".into(),
            Arc::new(|args: &[Value]| Ok(Value::from(args[0].to_string().to_uppercase()))),
        );
        engine.add_functions(&funcs);
        assert_eq!(engine.execute("t", b"{{ shout(\"hi\") }}", &json!({})).unwrap(), b"HI");
    }

    #[test]
    fn include_reads_relative_to_source_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("part"), "included\n").unwrap();

        let mut engine = engine();
        engine.add_function(
            "include",
            include_func(Arc::new(RealSystem::new()), temp.path().to_path_buf()),
        );
        assert_eq!(engine.execute("t", b"{{ include(\"part\") }}", &json!({})).unwrap(), b"included\n");
        assert!(engine.execute("t", b"{{ include(\"nope\") }}", &json!({})).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn output_runs_command() {
        let mut engine = engine();
        engine.add_function("output", output_func(Arc::new(RealSystem::new())));
        let result = engine.execute("t", b"{{ output(\"echo\", \"hi\") }}", &json!({}));
        assert_eq!(result.unwrap(), b"hi\n");
    }
}
