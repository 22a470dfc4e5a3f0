use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "parsers/zfs.pest"] // relative to src
pub struct ZfsParser;

#[cfg(test)]
mod test {
    use super::{Rule, ZfsParser};
    use pest::{consumes_to, parses_to, Parser};

    #[test]
    fn test_parse_filesystem_name_root() {
        let line = "z";

        parses_to! {
            parser: ZfsParser,
            input: line,
            rule: Rule::dataset_name,
            tokens: [
                dataset_name(0, 1, [
                    filesystem(0, 1, [pool(0, 1)]),
                    EOI(1, 1)
                ])
            ]
        }
    }

    #[test]
    fn test_parse_filesystem_name_nested_snapshot() {
        let line = "z/foo/bar@backup-20190707";

        parses_to! {
            parser: ZfsParser,
            input: line,
            rule: Rule::dataset_name,
            tokens: [
                dataset_name(0, 25, [
                    filesystem(0, 9, [pool(0, 1), component(2, 5), component(6, 9)]),
                    snapshot(9, 25, [component(10, 25)]),
                    EOI(25, 25)
                ])
            ]
        }
    }

    #[test]
    fn test_parse_bookmark() {
        let pairs = ZfsParser::parse(Rule::dataset_name, "tank/usr#mark").unwrap();
        let rules: Vec<Rule> =
            pairs.flatten().map(|pair| pair.as_rule()).filter(|r| *r == Rule::bookmark).collect();
        assert_eq!(vec![Rule::bookmark], rules);
    }

    #[test]
    fn test_reject_bad_names() {
        for name in &["", "/usr/home", "tank/", "tank//a", "tank@a@b", "tank@a#b", "1tank", "tank/a@"] {
            assert!(ZfsParser::parse(Rule::dataset_name, name).is_err(), "{} parsed", name);
        }
    }
}
