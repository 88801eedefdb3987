mod analysis;
mod controller;
mod export;
mod handlers;
mod nlp;
mod run;
#[cfg(test)]
mod tests;

pub use run::run;
