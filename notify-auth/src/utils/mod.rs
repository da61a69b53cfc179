pub mod codes;
pub mod password;
pub mod validation;

pub use codes::{generate_code, hash_code};
pub use password::{Password, SecretHasher};
pub use validation::ValidatedJson;
