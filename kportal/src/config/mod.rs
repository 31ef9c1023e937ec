mod parse;
mod service;
mod toml;

pub(crate) use self::{
  parse::parse_opts,
  service::ConfigTomlReloader,
  toml::{ConfigToml, PortalConfig},
};
