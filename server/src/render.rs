use crate::activity::DisplayPage;
use axum::{
    http::header,
    response::{IntoResponse, Response},
};
use minijinja::{context, Environment};
use thiserror::Error;

// The `.html` suffix turns on minijinja's HTML auto-escaping.
const TEMPLATE_NAME: &str = "activity.html";
const TEMPLATE_SOURCE: &str = include_str!("../templates/activity.html");

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputMode {
    Json,
    Markup,
}

/// TRMNL view sizes the markup can be laid out for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum Layout {
    Full,
    HalfHorizontal,
    HalfVertical,
    Quadrant,
}

impl Layout {
    fn as_str(self) -> &'static str {
        match self {
            Layout::Full => "full",
            Layout::HalfHorizontal => "half_horizontal",
            Layout::HalfVertical => "half_vertical",
            Layout::Quadrant => "quadrant",
        }
    }

    fn columns(self) -> u8 {
        match self {
            Layout::Full => 2,
            Layout::HalfHorizontal => 4,
            Layout::HalfVertical | Layout::Quadrant => 1,
        }
    }

    fn show_posters(self) -> bool {
        self != Layout::Quadrant
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("serialize page: {0}")]
    Json(#[from] serde_json::Error),

    #[error("render template: {0}")]
    Template(#[from] minijinja::Error),
}

pub struct Rendered {
    pub content_type: &'static str,
    pub body: String,
}

impl IntoResponse for Rendered {
    fn into_response(self) -> Response {
        ([(header::CONTENT_TYPE, self.content_type)], self.body).into_response()
    }
}

pub struct Renderer {
    env: Environment<'static>,
    mode: OutputMode,
    layout: Layout,
}

impl Renderer {
    /// Compiles the markup template up front so a broken template stops startup.
    pub fn new(mode: OutputMode, layout: Layout) -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        env.add_template(TEMPLATE_NAME, TEMPLATE_SOURCE)?;
        Ok(Self { env, mode, layout })
    }

    pub fn render(&self, page: &DisplayPage) -> Result<Rendered, RenderError> {
        match self.mode {
            OutputMode::Json => Ok(Rendered {
                content_type: "application/json",
                body: serde_json::to_string(page)?,
            }),
            OutputMode::Markup => {
                let body = self.env.get_template(TEMPLATE_NAME)?.render(context! {
                    page => page,
                    layout => self.layout.as_str(),
                    columns => self.layout.columns(),
                    show_posters => self.layout.show_posters(),
                })?;
                Ok(Rendered {
                    content_type: "text/html; charset=utf-8",
                    body,
                })
            }
        }
    }
}
