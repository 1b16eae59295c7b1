use super::ast::{Arg, Command, ConditionExpr, Node, PredicateCall, is_name_char};
use super::{MAX_COMMAND_LENGTH, MAX_NESTING_DEPTH, ParseError, ParseResult, TERMINATOR};

/// Characters of context shown on either side of an error position.
const SNIPPET_CONTEXT: usize = 20;

/// Parse a single command: `\verb node* ---`.
///
/// Whitespace around the command is ignored; anything else after the
/// terminator is an error.
pub fn parse(text: &str) -> ParseResult<Command> {
    let mut parser = Parser::new(text);

    if parser.chars.len() > MAX_COMMAND_LENGTH {
        return Err(parser.error(
            format!(
                "Command too long ({} characters). Maximum is {}",
                parser.chars.len(),
                MAX_COMMAND_LENGTH
            ),
            MAX_COMMAND_LENGTH,
        ));
    }

    parser.skip_ws();
    let command = parser.parse_command()?;
    parser.skip_ws();
    if !parser.eof() {
        return Err(parser.error_here("Unexpected text after --- terminator"));
    }
    Ok(command)
}

#[derive(Clone, Copy)]
enum RefKind {
    Entity,
    Space,
}

impl RefKind {
    fn label(self) -> &'static str {
        match self {
            RefKind::Entity => "entity",
            RefKind::Space => "space",
        }
    }

    fn sigil(self) -> char {
        match self {
            RefKind::Entity => '@',
            RefKind::Space => '#',
        }
    }

    fn node(self, name: String) -> Node {
        match self {
            RefKind::Entity => Node::EntityRef(name),
            RefKind::Space => Node::SpaceRef(name),
        }
    }
}

struct Parser {
    chars: Vec<char>,
    index: usize,
    depth: usize,
}

impl Parser {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            index: 0,
            depth: 0,
        }
    }

    fn eof(&self) -> bool {
        self.index >= self.chars.len()
    }

    fn current(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    fn peek_char(&self) -> Option<char> {
        self.chars.get(self.index + 1).copied()
    }

    fn advance(&mut self) {
        if self.index < self.chars.len() {
            self.index += 1;
        }
    }

    fn starts_with(&self, token: &str) -> bool {
        let mut at = self.index;
        for expected in token.chars() {
            if self.chars.get(at) != Some(&expected) {
                return false;
            }
            at += 1;
        }
        true
    }

    fn at_terminator(&self) -> bool {
        self.starts_with(TERMINATOR)
    }

    fn skip_ws(&mut self) {
        while let Some(ch) = self.current() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    /// Match a case-insensitive keyword that is not the prefix of a longer word.
    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let len = keyword.chars().count();
        let candidate: String = self.chars.iter().skip(self.index).take(len).collect();
        if !candidate.eq_ignore_ascii_case(keyword) {
            return false;
        }
        if let Some(next) = self.chars.get(self.index + len) {
            if is_name_char(*next) {
                return false;
            }
        }
        self.index += len;
        true
    }

    fn eat_symbol(&mut self, symbol: &str) -> bool {
        if self.starts_with(symbol) {
            self.index += symbol.chars().count();
            true
        } else {
            false
        }
    }

    fn enter(&mut self, at: usize) -> ParseResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(self.error(
                format!(
                    "Command nesting too deep (depth {}). Maximum is {}",
                    self.depth, MAX_NESTING_DEPTH
                ),
                at,
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn snippet(&self, at: usize) -> String {
        let start = at.saturating_sub(SNIPPET_CONTEXT);
        let end = (at + SNIPPET_CONTEXT).min(self.chars.len());
        let mut snippet = String::new();
        if start > 0 {
            snippet.push_str("...");
        }
        snippet.extend(&self.chars[start.min(end)..end]);
        if end < self.chars.len() {
            snippet.push_str("...");
        }
        snippet
    }

    /// Error located at the 0-based character index `at`.
    fn error(&self, message: impl Into<String>, at: usize) -> ParseError {
        ParseError::new(message, at + 1, self.snippet(at))
    }

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        self.error(message, self.index)
    }

    fn parse_command(&mut self) -> ParseResult<Command> {
        if self.current() != Some('\\') {
            return Err(self.error_here("Commands must start with backslash (\\)"));
        }
        self.advance();

        let verb = self.parse_name("command")?;
        let nodes = self.parse_nodes()?;

        if !self.at_terminator() {
            return Err(self.error_here("Commands must end with --- terminator"));
        }
        self.index += TERMINATOR.len();

        Ok(Command { verb, nodes })
    }

    fn parse_nodes(&mut self) -> ParseResult<Vec<Node>> {
        let mut nodes = Vec::new();
        loop {
            self.skip_ws();
            if self.eof() || self.at_terminator() {
                return Ok(nodes);
            }

            match self.current() {
                Some('@') => nodes.extend(self.parse_refs(RefKind::Entity)?),
                Some('#') => nodes.extend(self.parse_refs(RefKind::Space)?),
                Some('\\') => {
                    return Err(self.error_here(
                        "Backslash (\\) not allowed in text content. Use it only to start commands: \\command ---",
                    ));
                }
                Some('?') if self.peek_char() == Some('(') => {
                    nodes.push(self.parse_condition()?);
                }
                Some('$') if self.peek_char() == Some('(') => {
                    nodes.extend(self.parse_queries()?);
                }
                _ => nodes.push(self.parse_text()),
            }
        }
    }

    /// Read a name at the cursor, stopping before a terminator.
    fn parse_name(&mut self, kind: &str) -> ParseResult<String> {
        let start = self.index;
        while let Some(ch) = self.current() {
            if !is_name_char(ch) || self.at_terminator() {
                break;
            }
            self.advance();
        }

        if start == self.index {
            return Err(self.error(
                format!(
                    "Empty {kind} name. Names must start with a letter or number, and contain only letters, numbers, hyphens, and underscores"
                ),
                start,
            ));
        }
        if !self.chars[start].is_ascii_alphanumeric() {
            let name: String = self.chars[start..self.index].iter().collect();
            return Err(self.error(
                format!("Invalid {kind} name '{name}'. Names must start with a letter or number"),
                start,
            ));
        }
        Ok(self.chars[start..self.index].iter().collect())
    }

    /// Validate a name taken from a group; `at` is the index of its first char.
    fn check_group_name(&self, name: &str, kind: RefKind, at: usize) -> ParseResult<()> {
        let label = kind.label();
        for (offset, ch) in name.chars().enumerate() {
            let valid = if offset == 0 {
                ch.is_ascii_alphanumeric()
            } else {
                is_name_char(ch)
            };
            if !valid {
                return Err(self.error(
                    format!(
                        "Invalid {label} name '{name}'. Names must start with a letter or number, and contain only letters, numbers, hyphens, and underscores"
                    ),
                    at + offset,
                ));
            }
        }
        if let Some(byte_offset) = name.find(TERMINATOR) {
            let offset = name[..byte_offset].chars().count();
            return Err(self.error(
                format!("Invalid {label} name '{name}'. Names may not contain ---"),
                at + offset,
            ));
        }
        Ok(())
    }

    /// `@name`, `@(a, b)`, `#name`, `#(a, b)`; groups expand to one node per name.
    fn parse_refs(&mut self, kind: RefKind) -> ParseResult<Vec<Node>> {
        self.advance(); // sigil

        if self.current() != Some('(') {
            let name = self.parse_name(kind.label())?;
            return Ok(vec![kind.node(name)]);
        }

        let open = self.index;
        self.advance();

        let mut names: Vec<(String, usize)> = Vec::new();
        let mut element = String::new();
        let mut element_start = self.index;
        loop {
            match self.current() {
                None => {
                    return Err(self.error(
                        format!(
                            "Unclosed {} group {}(...). Missing closing parenthesis",
                            kind.label(),
                            kind.sigil()
                        ),
                        open,
                    ));
                }
                Some(ch @ (',' | ')')) => {
                    let leading = element.chars().take_while(|c| c.is_whitespace()).count();
                    let trimmed = element.trim();
                    if !trimmed.is_empty() {
                        names.push((trimmed.to_string(), element_start + leading));
                    }
                    element.clear();
                    self.advance();
                    element_start = self.index;
                    if ch == ')' {
                        break;
                    }
                }
                Some(ch) => {
                    element.push(ch);
                    self.advance();
                }
            }
        }

        // An empty group is blamed on its opening parenthesis.
        if names.is_empty() {
            return Err(self.error(
                format!(
                    "Empty {} group {}(). Must contain at least one {} name",
                    kind.label(),
                    kind.sigil(),
                    kind.label()
                ),
                open,
            ));
        }

        let mut nodes = Vec::with_capacity(names.len());
        for (name, at) in names {
            self.check_group_name(&name, kind, at)?;
            nodes.push(kind.node(name));
        }
        Ok(nodes)
    }

    fn parse_condition(&mut self) -> ParseResult<Node> {
        let open = self.index + 1;
        self.index += 2; // ?(
        self.enter(open)?;

        self.skip_ws();
        if self.current() == Some(')') {
            return Err(self.error_here("Empty condition ?(). Must contain an expression"));
        }

        let expr = self.parse_or()?;
        self.skip_ws();
        match self.current() {
            Some(')') => self.advance(),
            None => {
                return Err(self.error(
                    "Unclosed condition ?(... - missing closing parenthesis",
                    open,
                ));
            }
            Some(_) => return Err(self.error_here("Expected ')' to close condition")),
        }

        self.leave();
        Ok(Node::Condition(expr))
    }

    fn parse_or(&mut self) -> ParseResult<ConditionExpr> {
        let mut operands = vec![self.parse_and()?];
        loop {
            self.skip_ws();
            if self.eat_symbol("||") || self.eat_keyword("or") {
                operands.push(self.parse_and()?);
            } else {
                break;
            }
        }
        Ok(if operands.len() == 1 {
            operands.remove(0)
        } else {
            ConditionExpr::Or(operands)
        })
    }

    fn parse_and(&mut self) -> ParseResult<ConditionExpr> {
        let mut operands = vec![self.parse_unary()?];
        loop {
            self.skip_ws();
            if self.eat_symbol("&&") || self.eat_keyword("and") {
                operands.push(self.parse_unary()?);
            } else {
                break;
            }
        }
        Ok(if operands.len() == 1 {
            operands.remove(0)
        } else {
            ConditionExpr::And(operands)
        })
    }

    fn parse_unary(&mut self) -> ParseResult<ConditionExpr> {
        // Negations do not nest scopes; a chain of them is bounded by the length limit.
        let mut negations = 0usize;
        loop {
            self.skip_ws();
            if self.eat_keyword("not") || self.eat_symbol("!") {
                negations += 1;
            } else {
                break;
            }
        }
        let start = self.index;

        let mut expr = self.parse_operand(start)?;
        for _ in 0..negations {
            expr = ConditionExpr::Not(Box::new(expr));
        }
        Ok(expr)
    }

    fn parse_operand(&mut self, start: usize) -> ParseResult<ConditionExpr> {
        if self.current() == Some('(') {
            self.enter(start)?;
            self.advance();
            let expr = self.parse_or()?;
            self.skip_ws();
            match self.current() {
                Some(')') => self.advance(),
                None => {
                    return Err(self.error("Unclosed group (... - missing closing parenthesis", start));
                }
                Some(_) => return Err(self.error_here("Expected ')' to close group")),
            }
            self.leave();
            return Ok(expr);
        }

        self.parse_predicate()
    }

    fn parse_predicate(&mut self) -> ParseResult<ConditionExpr> {
        let start = self.index;
        while let Some(ch) = self.current() {
            if ch.is_ascii_alphanumeric() || ch == '_' || (ch == '-' && self.index > start) {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.index {
            return Err(match self.current() {
                Some(ch) => self.error_here(format!("Expected a predicate, found '{ch}'")),
                None => self.error_here("Expected a predicate, found end of input"),
            });
        }

        let name: String = self.chars[start..self.index].iter().collect();
        if ["and", "or", "not"]
            .iter()
            .any(|keyword| name.eq_ignore_ascii_case(keyword))
        {
            return Err(self.error(format!("Expected a predicate, found keyword '{name}'"), start));
        }

        let mut args = Vec::new();
        if self.current() == Some('(') {
            let open = self.index;
            self.advance();
            self.skip_ws();
            if self.current() == Some(')') {
                self.advance();
            } else {
                loop {
                    self.skip_ws();
                    args.push(self.parse_arg()?);
                    self.skip_ws();
                    match self.current() {
                        Some(',') => self.advance(),
                        Some(')') => {
                            self.advance();
                            break;
                        }
                        None => {
                            return Err(self.error(
                                format!("Unclosed argument list for '{name}'"),
                                open,
                            ));
                        }
                        Some(_) => return Err(self.error_here("Expected ',' or ')' in argument list")),
                    }
                }
            }
        }

        Ok(ConditionExpr::Predicate(PredicateCall { name, args }))
    }

    fn parse_arg(&mut self) -> ParseResult<Arg> {
        match self.current() {
            Some(sigil @ ('@' | '#')) => {
                let kind = if sigil == '@' {
                    RefKind::Entity
                } else {
                    RefKind::Space
                };
                self.advance();
                if self.current() == Some('(') {
                    return Err(self.error_here(format!(
                        "{} groups are not allowed in predicate arguments",
                        kind.label()
                    )));
                }
                let name = self.parse_name(kind.label())?;
                Ok(match kind {
                    RefKind::Entity => Arg::Entity(name),
                    RefKind::Space => Arg::Space(name),
                })
            }
            _ => {
                let start = self.index;
                while let Some(ch) = self.current() {
                    if ch.is_whitespace() || matches!(ch, ',' | '(' | ')' | '@' | '#' | '\\' | '$' | '?') {
                        break;
                    }
                    self.advance();
                }
                if start == self.index {
                    return Err(self.error_here("Expected an argument"));
                }
                Ok(Arg::Word(self.chars[start..self.index].iter().collect()))
            }
        }
    }

    fn parse_queries(&mut self) -> ParseResult<Vec<Node>> {
        let open = self.index + 1;
        self.index += 2; // $(
        self.enter(open)?;

        let mut queries = Vec::new();
        loop {
            self.skip_ws();
            match self.current() {
                Some('\\') => queries.push(Node::Query(self.parse_command()?)),
                Some(')') => {
                    if queries.is_empty() {
                        return Err(self.error_here(
                            "Empty query $(). Must contain at least one \\command ---",
                        ));
                    }
                    self.advance();
                    break;
                }
                None => {
                    return Err(self.error(
                        "Unclosed query $(\\... - missing closing parenthesis",
                        open,
                    ));
                }
                Some(_) => return Err(self.error_here("Queries must contain commands: $(\\command ---)")),
            }
        }

        self.leave();
        Ok(queries)
    }

    /// Free text up to the next special token or terminator.
    fn parse_text(&mut self) -> Node {
        let start = self.index;
        while let Some(ch) = self.current() {
            if matches!(ch, '@' | '#' | '\\') || self.at_terminator() {
                break;
            }
            if matches!(ch, '?' | '$') && self.peek_char() == Some('(') {
                break;
            }
            self.advance();
        }
        Node::Text(self.chars[start..self.index].iter().collect())
    }
}
