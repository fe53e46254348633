/**
 * INTERPOLATION - Expansion des templates de commandes `%(nom)s`
 *
 * RÔLE :
 * Transformer les attributs des cartes et ressources en lignes de commande.
 *
 * FONCTIONNEMENT :
 * - Ré-expansion jusqu'au point fixe ; un attribut peut citer d'autres attributs
 * - Les maps plus tardives gagnent en cas de collision de clés
 * - Les valeurs utilisateur ne sont jamais interpolées dans le texte : elles
 *   sont liées après découpage en argv, dans l'argument qui les contient
 *
 * SÉCURITÉ :
 * Aucun échappement shell n'est fait ici ; seule la configuration atteint le texte.
 */

use std::collections::{HashMap, HashSet};

use crate::error::{LabError, LabResult, TemplateError};
use crate::runner::CommandLine;

pub const DEFAULT_MAX_PASSES: usize = 10;

const MAX_USER_VALUE_LEN: usize = 4096;

/// Variable set: ordered list of maps, later ones override earlier ones
pub type Vars<'a> = [&'a HashMap<String, String>];

#[derive(Debug, PartialEq, Eq)]
struct Placeholder<'a> {
    start: usize,
    end: usize,
    key: &'a str,
}

fn scan(template: &str) -> Result<Vec<Placeholder<'_>>, TemplateError> {
    let mut found = Vec::new();
    let mut from = 0;
    while let Some(rel) = template[from..].find("%(") {
        let start = from + rel;
        let key_start = start + 2;
        let Some(close) = template[key_start..].find(')') else {
            return Err(TemplateError::Unterminated(start));
        };
        let key_end = key_start + close;
        if template[key_end + 1..].chars().next() != Some('s') {
            return Err(TemplateError::Unterminated(start));
        }
        found.push(Placeholder {
            start,
            end: key_end + 2,
            key: &template[key_start..key_end],
        });
        from = key_end + 2;
    }
    Ok(found)
}

fn lookup<'a>(vars: &'a Vars<'_>, key: &str) -> Option<&'a String> {
    vars.iter().rev().find_map(|m| m.get(key))
}

#[derive(Debug, Clone)]
pub struct Interpolator {
    max_passes: usize,
    deferred: HashSet<String>,
}

impl Default for Interpolator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PASSES)
    }
}

impl Interpolator {
    pub fn new(max_passes: usize) -> Self {
        Self {
            max_passes: max_passes.max(1),
            deferred: HashSet::new(),
        }
    }

    /// Keys left untouched by `expand`, bound later by `command`
    pub fn defer<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deferred.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Expands every non-deferred placeholder until a fixed point is reached
    pub fn expand(&self, template: &str, vars: &Vars<'_>) -> Result<String, TemplateError> {
        let mut current = template.to_string();
        for _ in 0..self.max_passes {
            let placeholders = scan(&current)?;
            let pending: Vec<_> = placeholders
                .into_iter()
                .filter(|p| !self.deferred.contains(p.key))
                .collect();
            if pending.is_empty() {
                return Ok(current);
            }

            let mut next = String::with_capacity(current.len());
            let mut cursor = 0;
            for p in pending {
                let value = lookup(vars, p.key)
                    .ok_or_else(|| TemplateError::MissingKey(p.key.to_string()))?;
                next.push_str(&current[cursor..p.start]);
                next.push_str(value);
                cursor = p.end;
            }
            next.push_str(&current[cursor..]);
            current = next;
        }

        let unresolved = scan(&current)?
            .iter()
            .any(|p| !self.deferred.contains(p.key));
        if unresolved {
            Err(TemplateError::TooDeep(self.max_passes))
        } else {
            Ok(current)
        }
    }

    /// Expands configuration variables, splits into argv, then binds user values
    /// inside individual arguments
    pub fn command(
        &self,
        template: &str,
        vars: &Vars<'_>,
        user_args: &HashMap<String, String>,
    ) -> LabResult<CommandLine> {
        for (key, value) in user_args {
            validate_user_value(key, value)?;
        }
        let deferring = self.clone().defer(user_args.keys().cloned());
        let expanded = deferring.expand(template, vars)?;
        let argv = shell_words::split(&expanded).map_err(|e| TemplateError::Lex(e.to_string()))?;
        let argv = argv
            .into_iter()
            .map(|arg| bind_user_args(&arg, user_args))
            .collect::<Result<Vec<_>, _>>()?;
        CommandLine::from_argv(argv)
    }
}

/// Single-pass literal substitution of user values inside one argument
fn bind_user_args(arg: &str, user_args: &HashMap<String, String>) -> Result<String, TemplateError> {
    let placeholders = scan(arg)?;
    let mut out = String::with_capacity(arg.len());
    let mut cursor = 0;
    for p in placeholders {
        let value = user_args
            .get(p.key)
            .ok_or_else(|| TemplateError::MissingKey(p.key.to_string()))?;
        out.push_str(&arg[cursor..p.start]);
        out.push_str(value);
        cursor = p.end;
    }
    out.push_str(&arg[cursor..]);
    Ok(out)
}

fn validate_user_value(key: &str, value: &str) -> LabResult<()> {
    if value.len() > MAX_USER_VALUE_LEN {
        return Err(LabError::invalid(key, "value too long"));
    }
    if value.chars().any(|c| c == '\0') {
        return Err(LabError::invalid(key, "value contains a NUL byte"));
    }
    Ok(())
}

/// Strict check for user values that end up as paths or file names
pub fn validate_path_value(field: &str, value: &str) -> LabResult<()> {
    if value.is_empty() || value.len() > 1024 {
        return Err(LabError::invalid(field, "must be 1-1024 characters"));
    }
    if value.starts_with('-') {
        return Err(LabError::invalid(field, "must not start with '-'"));
    }
    if value.split('/').any(|part| part == "..") {
        return Err(LabError::invalid(field, "must not contain '..'"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '+' | ':'))
    {
        return Err(LabError::invalid(
            field,
            format!("'{value}' contains characters outside [A-Za-z0-9/._+:-]"),
        ));
    }
    Ok(())
}

/// Expands `template` against `vars` with the default pass limit
pub fn interpolate(template: &str, vars: &Vars<'_>) -> Result<String, TemplateError> {
    Interpolator::default().expand(template, vars)
}
