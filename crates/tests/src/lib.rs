//! Integration tests spanning the core and infrastructure crates

#[cfg(test)]
mod support;

#[cfg(test)]
mod capture_pipeline;
#[cfg(test)]
mod policy;
#[cfg(test)]
mod routing;
#[cfg(test)]
mod threaded;
