pub mod backend;
pub mod batch_writer;
pub mod derive;
pub mod extract;
pub mod generation;
pub mod pipeline;
pub mod prompt;
pub mod reporter;
pub mod selector;
pub mod settings;
pub mod space;
pub mod store;
pub mod validator;
