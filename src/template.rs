use std::fmt::{self, Display};

use anyhow::{Context, Result};
use handlebars::Handlebars;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    Report,
}

impl Template {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Report => "report",
        }
    }
}

impl Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

pub fn new() -> Result<Handlebars<'static>> {
    let mut tt = Handlebars::new();
    tt.register_template_string(
        Template::Report.as_str(),
        include_str!("template/report.hbs"),
    )
    .with_context(|| format!("could not register the `{}` template", Template::Report))?;

    Ok(tt)
}
