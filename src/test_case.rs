//! Concrete inputs exchanged between nodes.
//!
//! A [`TestCase`] is either complete (every element present) or a patch that
//! only carries the elements differing from a base test case. Identity is the
//! SHA-256 of the complete element list.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{Read, Write};

use crate::error::{DispatchError, DispatchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestCaseHash([u8; 32]);

impl TestCaseHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TestCaseHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// One named input buffer (an argument, a file, stdin).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseElement {
    pub name: Vec<u8>,
    pub data: Vec<u8>,
}

impl TestCaseElement {
    pub fn new(name: impl Into<Vec<u8>>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Replacement elements against a base test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCasePatch {
    pub base: TestCaseHash,
    pub elements: Vec<(u32, TestCaseElement)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    elements: Vec<TestCaseElement>,
    patch: Option<TestCasePatch>,
}

impl TestCase {
    pub fn new(elements: Vec<TestCaseElement>) -> Self {
        Self {
            elements,
            patch: None,
        }
    }

    pub fn from_patch(patch: TestCasePatch) -> Self {
        Self {
            elements: Vec::new(),
            patch: Some(patch),
        }
    }

    /// Build a patch of `target` against `base`, keeping only differing
    /// elements. Falls back to a complete copy when the shapes differ.
    pub fn diff(base: &TestCase, target: &TestCase) -> TestCase {
        if base.is_patch() || target.is_patch() || base.elements.len() != target.elements.len() {
            return target.clone();
        }
        let elements = target
            .elements
            .iter()
            .zip(&base.elements)
            .enumerate()
            .filter(|(_, (t, b))| t != b)
            .map(|(i, (t, _))| (i as u32, t.clone()))
            .collect();
        TestCase::from_patch(TestCasePatch {
            base: base.hash(),
            elements,
        })
    }

    pub fn elements(&self) -> &[TestCaseElement] {
        &self.elements
    }

    pub fn is_patch(&self) -> bool {
        self.patch.is_some()
    }

    pub fn patch(&self) -> Option<&TestCasePatch> {
        self.patch.as_ref()
    }

    /// Complete test case from this patch applied to `base`.
    pub fn reconstruct(&self, base: &TestCase) -> DispatchResult<TestCase> {
        let Some(patch) = &self.patch else {
            return Ok(self.clone());
        };
        if base.hash() != patch.base {
            return Err(DispatchError::content(format!(
                "patch targets base {}, got {}",
                patch.base,
                base.hash()
            )));
        }
        let mut elements = base.elements.clone();
        for (index, element) in &patch.elements {
            let slot = elements.get_mut(*index as usize).ok_or_else(|| {
                DispatchError::content(format!(
                    "patch element {} out of range for base with {} elements",
                    index,
                    base.elements.len()
                ))
            })?;
            *slot = element.clone();
        }
        Ok(TestCase::new(elements))
    }

    /// Content hash over the complete element list.
    ///
    /// For a patch this is the hash of its (empty) element list; reconstruct
    /// first to obtain the identity of the test case it describes.
    pub fn hash(&self) -> TestCaseHash {
        let mut hasher = Sha256::new();
        hasher.update((self.elements.len() as u32).to_le_bytes());
        for e in &self.elements {
            hasher.update((e.name.len() as u32).to_le_bytes());
            hasher.update(&e.name);
            hasher.update((e.data.len() as u32).to_le_bytes());
            hasher.update(&e.data);
        }
        TestCaseHash(hasher.finalize().into())
    }

    /// Approximate wire size, used to bound batches.
    pub fn byte_size(&self) -> u64 {
        let elements: usize = self.elements.iter().map(|e| e.name.len() + e.data.len() + 8).sum();
        let patch: usize = self
            .patch
            .as_ref()
            .map(|p| p.elements.iter().map(|(_, e)| e.name.len() + e.data.len() + 12).sum::<usize>() + 32)
            .unwrap_or(0);
        (elements + patch + 4) as u64
    }

    /// Persist in the portable layout: u32 count, then per element u32 name
    /// length, name, u32 data length, data (all little endian).
    pub fn write_to<W: Write>(&self, mut out: W) -> DispatchResult<()> {
        if self.is_patch() {
            return Err(DispatchError::content("cannot persist an unreconstructed patch"));
        }
        out.write_all(&(self.elements.len() as u32).to_le_bytes())?;
        for e in &self.elements {
            out.write_all(&(e.name.len() as u32).to_le_bytes())?;
            out.write_all(&e.name)?;
            out.write_all(&(e.data.len() as u32).to_le_bytes())?;
            out.write_all(&e.data)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(mut input: R) -> DispatchResult<TestCase> {
        fn read_u32<R: Read>(r: &mut R) -> DispatchResult<u32> {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf)
                .map_err(|e| DispatchError::content(format!("truncated test case: {}", e)))?;
            Ok(u32::from_le_bytes(buf))
        }
        fn read_bytes<R: Read>(r: &mut R) -> DispatchResult<Vec<u8>> {
            let len = read_u32(r)? as usize;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf)
                .map_err(|e| DispatchError::content(format!("truncated test case: {}", e)))?;
            Ok(buf)
        }

        let count = read_u32(&mut input)?;
        let mut elements = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let name = read_bytes(&mut input)?;
            let data = read_bytes(&mut input)?;
            elements.push(TestCaseElement { name, data });
        }
        Ok(TestCase::new(elements))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tc(args: &[&str]) -> TestCase {
        TestCase::new(
            args.iter()
                .enumerate()
                .map(|(i, a)| TestCaseElement::new(format!("argv_{}", i), a.as_bytes()))
                .collect(),
        )
    }

    #[test]
    fn test_hash_depends_on_content_only() {
        assert_eq!(tc(&["a", "b"]).hash(), tc(&["a", "b"]).hash());
        assert_ne!(tc(&["a", "b"]).hash(), tc(&["b", "a"]).hash());
        // Length prefixes keep ("ab","") and ("a","b") apart.
        let split = TestCase::new(vec![TestCaseElement::new("n", "ab"), TestCaseElement::new("m", "")]);
        let other = TestCase::new(vec![TestCaseElement::new("n", "a"), TestCaseElement::new("m", "b")]);
        assert_ne!(split.hash(), other.hash());
    }

    #[test]
    fn test_diff_and_reconstruct() {
        let base = tc(&["one", "two", "three"]);
        let target = tc(&["one", "TWO", "three"]);
        let patch = TestCase::diff(&base, &target);
        assert!(patch.is_patch());
        assert_eq!(patch.patch().unwrap().elements.len(), 1);
        assert_eq!(patch.reconstruct(&base).unwrap(), target);
    }

    #[test]
    fn test_reconstruct_rejects_wrong_base() {
        let base = tc(&["one"]);
        let patch = TestCase::diff(&base, &tc(&["two"]));
        let err = patch.reconstruct(&tc(&["zzz"])).unwrap_err();
        assert!(matches!(err, DispatchError::Content(_)));
    }

    #[test]
    fn test_reconstruct_rejects_out_of_range_index() {
        let base = tc(&["one"]);
        let patch = TestCase::from_patch(TestCasePatch {
            base: base.hash(),
            elements: vec![(5, TestCaseElement::new("x", "y"))],
        });
        assert!(patch.reconstruct(&base).is_err());
    }

    #[test]
    fn test_portable_layout() {
        let t = TestCase::new(vec![TestCaseElement::new("ab", "xyz")]);
        let mut buf = Vec::new();
        t.write_to(&mut buf).unwrap();
        assert_eq!(
            buf,
            vec![1, 0, 0, 0, 2, 0, 0, 0, b'a', b'b', 3, 0, 0, 0, b'x', b'y', b'z']
        );
        assert_eq!(TestCase::read_from(buf.as_slice()).unwrap(), t);
    }

    #[test]
    fn test_truncated_input_is_content_error() {
        let err = TestCase::read_from(&[2u8, 0, 0, 0, 9][..]).unwrap_err();
        assert!(matches!(err, DispatchError::Content(_)));
    }

    #[test]
    fn test_hash_display_is_hex() {
        let s = tc(&["a"]).hash().to_string();
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
