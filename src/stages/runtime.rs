//! Runtime stage: minimal image running the installed project as an
//! unprivileged user.

use super::packages::{self, NONROOT_HOME, NONROOT_ID};
use super::{exec_form, value_quote, StageWriter};
use crate::core::codegen::{CompileError, Instruction, Keyword, Stage};
use crate::core::expand::expand;
use crate::core::resolver::ResolvedConfig;
use std::collections::BTreeMap;

/// Provenance labels on every image. User labels win on key collision.
pub const DEFAULT_LABELS: [(&str, &str); 3] = [
    ("org.opencontainers.image.description", "autogenerated by pyimage"),
    ("moby.buildkit.frontend", "pyimage"),
    ("pyimage.version", "v1"),
];

pub const AUTHORS_LABEL: &str = "org.opencontainers.image.authors";

/// Render the runtime stage. Env and label values are expanded against
/// `placeholders`.
pub fn instructions(
    config: &ResolvedConfig,
    placeholders: &BTreeMap<String, String>,
) -> Result<Vec<Instruction>, CompileError> {
    let mut w = StageWriter::new(Stage::Runtime);
    let substitute = |field: String, value: &str| {
        expand(value, placeholders).map_err(|source| CompileError::Placeholder {
            target: config.target_label().to_string(),
            field,
            source,
        })
    };

    w.push(
        Keyword::From,
        format!(
            "docker.io/python:{}-{}",
            config.python_version,
            config.flavor.image_tag()
        ),
    );

    if let Some(run) = packages::runtime_install(config.flavor, &config.system_deps) {
        w.push(Keyword::Run, run);
    }

    w.push(Keyword::Run, packages::create_user(config.flavor));
    w.push(Keyword::User, format!("{id}:{id}", id = NONROOT_ID));

    w.push(
        Keyword::Copy,
        format!(
            "--from=builder --chown={id}:{id} /root/.local {home}/.local",
            id = NONROOT_ID,
            home = NONROOT_HOME
        ),
    );
    w.push(Keyword::Env, format!("PATH=$PATH:{}/.local/bin", NONROOT_HOME));

    w.file_operations(&config.copy_files, &config.add_files);

    if !config.entrypoint.is_empty() {
        w.push(Keyword::Entrypoint, exec_form(&config.entrypoint));
    }
    if !config.command.is_empty() {
        w.push(Keyword::Cmd, exec_form(&config.command));
    }

    for (key, value) in &config.env {
        let value = substitute(format!("env '{}'", key), value)?;
        w.push(Keyword::Env, format!("{}={}", key, value_quote(&value)));
    }

    let mut labels: BTreeMap<&str, &str> = DEFAULT_LABELS.into_iter().collect();
    labels.extend(config.labels.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    for (key, value) in labels {
        let value = substitute(format!("label '{}'", key), value)?;
        w.push(Keyword::Label, format!("{}={}", key, value_quote(&value)));
    }

    if !config.authors.is_empty() {
        let authors = config
            .authors
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        w.push(
            Keyword::Label,
            format!("{}={}", AUTHORS_LABEL, value_quote(&authors)),
        );
    }

    Ok(w.finish())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Author, FileSpec, Flavor};
    use pretty_assertions::assert_eq;

    fn base_config() -> ResolvedConfig {
        ResolvedConfig {
            name: "svc".to_string(),
            target: Some("api".to_string()),
            python_version: "3.12".to_string(),
            ..Default::default()
        }
    }

    fn render(config: &ResolvedConfig, placeholders: &BTreeMap<String, String>) -> Vec<String> {
        instructions(config, placeholders)
            .unwrap()
            .iter()
            .map(|i| i.to_string())
            .collect()
    }

    #[test]
    fn test_runtime_minimal() {
        let lines = render(&base_config(), &BTreeMap::new());
        assert_eq!(
            lines,
            vec![
                "FROM docker.io/python:3.12-slim",
                "RUN useradd --uid=65532 --user-group --home-dir=/home/nonroot --create-home nonroot",
                "USER 65532:65532",
                "COPY --from=builder --chown=65532:65532 /root/.local /home/nonroot/.local",
                "ENV PATH=$PATH:/home/nonroot/.local/bin",
                "LABEL moby.buildkit.frontend=\"pyimage\"",
                "LABEL org.opencontainers.image.description=\"autogenerated by pyimage\"",
                "LABEL pyimage.version=\"v1\"",
            ]
        );
    }

    #[test]
    fn test_runtime_full_order() {
        let mut cfg = base_config();
        cfg.flavor = Flavor::Alpine;
        cfg.system_deps = vec!["libpq".to_string()];
        cfg.copy_files = vec![FileSpec {
            src: "conf".into(),
            dst: "/etc/svc".into(),
            checksum: None,
        }];
        cfg.entrypoint = vec!["svc".to_string()];
        cfg.command = vec!["serve".to_string(), "--port=8080".to_string()];
        cfg.env.insert("MODE".to_string(), "prod".to_string());
        cfg.authors = vec![Author {
            name: "Ada".into(),
            email: Some("ada@x.io".into()),
        }];

        let lines = render(&cfg, &BTreeMap::new());
        let pos = |needle: &str| {
            lines
                .iter()
                .position(|l| l.starts_with(needle))
                .unwrap_or_else(|| panic!("missing {}", needle))
        };
        assert_eq!(lines[0], "FROM docker.io/python:3.12-alpine");
        assert_eq!(lines[1], "RUN apk add --update-cache 'libpq' && rm -rf /var/cache/apk/*");
        assert!(pos("RUN addgroup") < pos("USER "));
        assert!(pos("USER ") < pos("COPY --from=builder"));
        assert!(pos("COPY --from=builder") < pos("COPY [\"conf\""));
        assert!(pos("COPY [\"conf\"") < pos("ENTRYPOINT"));
        assert!(pos("ENTRYPOINT") < pos("CMD"));
        assert!(pos("CMD") < pos("ENV MODE"));
        assert!(pos("ENV MODE") < pos("LABEL moby"));
        assert_eq!(lines.last().unwrap(), "LABEL org.opencontainers.image.authors=\"Ada <ada@x.io>\"");
        assert!(lines.contains(&"CMD [\"serve\",\"--port=8080\"]".to_string()));
    }

    #[test]
    fn test_runtime_user_label_wins() {
        let mut cfg = base_config();
        cfg.labels.insert(
            "org.opencontainers.image.description".to_string(),
            "billing api".to_string(),
        );
        let lines = render(&cfg, &BTreeMap::new());
        assert!(lines.contains(&"LABEL org.opencontainers.image.description=\"billing api\"".to_string()));
        assert!(!lines.iter().any(|l| l.contains("autogenerated")));
    }

    #[test]
    fn test_runtime_expands_env_and_labels() {
        let mut cfg = base_config();
        cfg.env.insert("BUILD".to_string(), "${SHA:-local}".to_string());
        cfg.labels.insert("revision".to_string(), "rev-$SHA".to_string());
        let placeholders = BTreeMap::from([("SHA".to_string(), "abc".to_string())]);
        let lines = render(&cfg, &placeholders);
        assert!(lines.contains(&"ENV BUILD=\"abc\"".to_string()));
        assert!(lines.contains(&"LABEL revision=\"rev-abc\"".to_string()));
    }

    #[test]
    fn test_runtime_placeholder_error_names_env() {
        let mut cfg = base_config();
        cfg.env.insert("BROKEN".to_string(), "${OPEN".to_string());
        let err = instructions(&cfg, &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().starts_with("target 'api': env 'BROKEN'"));
    }

    #[test]
    fn test_exec_form_escapes() {
        assert_eq!(
            exec_form(&["sh".to_string(), "-c".to_string(), "echo \"hi\"".to_string()]),
            "[\"sh\",\"-c\",\"echo \\\"hi\\\"\"]"
        );
    }
}
