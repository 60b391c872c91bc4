//! Guest configuration reported by the first VM node, and the seed test case
//! derived from it.

use serde::{Deserialize, Serialize};

use crate::test_case::{TestCase, TestCaseElement};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestArgument {
    pub index: u32,
    pub value: Vec<u8>,
    pub size: u32,
    pub concolic: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestFile {
    /// Path inside the guest; the element name is its final component.
    pub path: String,
    pub data: Vec<u8>,
    pub size: u64,
    pub concolic: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestStdin {
    pub value: Vec<u8>,
    pub size: u64,
    pub concolic: bool,
}

/// Target program invocation as seen inside the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestData {
    pub executable: String,
    pub arguments: Vec<GuestArgument>,
    pub files: Vec<GuestFile>,
    pub stdin: Option<GuestStdin>,
}

/// Freshness check for a VM disk image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub file_name: String,
    pub last_write_time: i64,
}

fn padded(value: &[u8], size: usize) -> Vec<u8> {
    let mut data = value.to_vec();
    if data.len() < size {
        data.resize(size, 0);
    }
    data
}

impl GuestData {
    /// Seed test case: one element per concolic input.
    pub fn extract_initial_test(&self) -> TestCase {
        let mut elements = Vec::new();

        for arg in self.arguments.iter().filter(|a| a.concolic) {
            elements.push(TestCaseElement::new(
                format!("argv_{}", arg.index),
                padded(&arg.value, arg.size as usize),
            ));
        }

        for file in self.files.iter().filter(|f| f.concolic) {
            let name = std::path::Path::new(&file.path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.path.clone());
            let data = padded(&file.data, file.size as usize);
            let posix = format!("{}-posix", name);
            elements.push(TestCaseElement::new(name, data.clone()));
            elements.push(TestCaseElement::new(posix, data));
        }

        if let Some(stdin) = self.stdin.as_ref().filter(|s| s.concolic) {
            let data = padded(&stdin.value, stdin.size as usize);
            elements.push(TestCaseElement::new("crete-stdin", data.clone()));
            elements.push(TestCaseElement::new("crete-stdin-posix", data));
        }

        TestCase::new(elements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_initial_test() {
        let guest = GuestData {
            executable: "/bin/prog".into(),
            arguments: vec![
                GuestArgument { index: 1, value: b"ab".to_vec(), size: 4, concolic: true },
                GuestArgument { index: 2, value: b"-v".to_vec(), size: 2, concolic: false },
            ],
            files: vec![GuestFile {
                path: "/tmp/input.txt".into(),
                data: b"hi".to_vec(),
                size: 3,
                concolic: true,
            }],
            stdin: Some(GuestStdin { value: vec![], size: 2, concolic: true }),
        };

        let tc = guest.extract_initial_test();
        let names: Vec<String> = tc
            .elements()
            .iter()
            .map(|e| String::from_utf8(e.name.clone()).unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["argv_1", "input.txt", "input.txt-posix", "crete-stdin", "crete-stdin-posix"]
        );
        assert_eq!(tc.elements()[0].data, b"ab\0\0");
        assert_eq!(tc.elements()[1].data, b"hi\0");
        assert_eq!(tc.elements()[2].data, b"hi\0");
        assert_eq!(tc.elements()[3].data, vec![0, 0]);
        assert_eq!(tc.elements()[4].data, vec![0, 0]);
    }

    #[test]
    fn test_posix_elements_carry_content() {
        let guest = GuestData {
            files: vec![GuestFile {
                path: "data.bin".into(),
                data: b"hi".to_vec(),
                size: 2,
                concolic: true,
            }],
            stdin: Some(GuestStdin { value: b"xyz".to_vec(), size: 3, concolic: true }),
            ..Default::default()
        };

        let tc = guest.extract_initial_test();
        let posix: Vec<&[u8]> = tc
            .elements()
            .iter()
            .filter(|e| e.name.ends_with(b"-posix"))
            .map(|e| e.data.as_slice())
            .collect();
        assert_eq!(posix, vec![b"hi".as_slice(), b"xyz".as_slice()]);
    }

    #[test]
    fn test_no_concolic_inputs_gives_empty_seed() {
        assert!(GuestData::default().extract_initial_test().elements().is_empty());
    }
}
