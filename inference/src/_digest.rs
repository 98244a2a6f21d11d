// SHA-256 digests of configuration items, hex encoded.
use std::fmt::Write;

use sha2::Digest;

pub struct Digester(sha2::Sha256);

impl Digester {
    pub fn new() -> Self {
        Digester(sha2::Sha256::new())
    }

    /// Feed one item; items are separated so that ("ab", "c") and ("a", "bc") differ.
    pub fn update(&mut self, data: impl AsRef<[u8]>) -> &mut Self {
        self.0.update(data.as_ref());
        self.0.update([0]);
        self
    }

    pub fn finalize(self) -> String {
        hex(&self.0.finalize())
    }
}

fn hex(hash: &impl AsRef<[u8]>) -> String {
    let mut digest = String::with_capacity(64);
    for b in hash.as_ref() {
        let _ = write!(&mut digest, "{b:02x}");
    }
    digest
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn items_are_separated() {
        let mut d1 = Digester::new();
        d1.update("ab").update("c");
        let mut d2 = Digester::new();
        d2.update("a").update("bc");
        let (h1, h2) = (d1.finalize(), d2.finalize());
        assert_ne!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
