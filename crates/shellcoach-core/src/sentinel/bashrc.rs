//! Sentinel definitions and the bash startup file that emits them
//!
//! Command boundaries are marked in-band with `0x1F` (Unit Separator)
//! framed sentinels. The byte never occurs in legitimate output, ANSI
//! escape sequences, or UTF-8 continuation bytes, so a streaming scanner
//! can pick it out unambiguously. `CMD_END` carries the exit code and the
//! working directory so no follow-up query is needed.
//!
//! Both sentinels fire from the prompt hook: `CMD_END:<rc>:<cwd>` for the
//! command that just finished, then `CMD_START` before the next prompt is
//! drawn. A capture window therefore spans prompt + echoed input + output;
//! the parser strips the first line to recover pure output.

/// Sentinel frame delimiter (Unit Separator).
pub const SENTINEL_BYTE: u8 = 0x1f;

/// Marker body opening a capture window.
pub const CMD_START: &str = "__SHELLCOACH_CMD_START__";

/// Marker body closing a capture window, as `CMD_END:<rc>:<cwd>`.
pub const CMD_END: &str = "__SHELLCOACH_CMD_END__";

/// Commands replaced with refusal stubs inside the sandbox shell.
pub const BLOCKED_COMMANDS: [&str; 7] =
    ["sudo", "su", "chroot", "mount", "umount", "fdisk", "parted"];

/// Build the bashrc that instruments bash for sentinel-based capture.
///
/// The prompt hook captures `$?` into a local variable as its first
/// statement; anything earlier would clobber the exit status of the
/// student's command. The prompt itself uses `\w`, so the working
/// directory in the prompt tracks `cd` without rebuilding the string.
pub fn generate_bashrc(sandbox_root: &str, user: &str, hostname: &str) -> String {
    let blocked_funcs = BLOCKED_COMMANDS
        .iter()
        .map(|cmd| format!(r#"{cmd}() {{ echo "{cmd}: not allowed in the sandbox"; return 1; }}"#))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"# shellcoach sandbox bashrc — generated, do not edit
export HOME="{sandbox_root}"
export PATH="/usr/local/bin:/usr/bin:/bin"
export TERM="xterm-256color"

# Colored prompt
export PS1='\[\033[01;32m\]{user}@{hostname}\[\033[00m\]:\[\033[01;34m\]\w\[\033[00m\]\$ '

# Colors and aliases
alias ls='ls --color=auto'
alias grep='grep --color=auto'
alias fgrep='fgrep --color=auto'
alias egrep='egrep --color=auto'
alias ll='ls -alF'
alias la='ls -A'
alias l='ls -CF'

# History settings
HISTCONTROL=ignoreboth
HISTSIZE=1000
shopt -s histappend
shopt -s checkwinsize

# Sentinel machinery: the prompt hook closes the finished command's
# capture window with its exit code and cwd, then opens the next window
# before the prompt is drawn.
__shellcoach_prompt_cmd() {{
    local rc=$?
    printf '\x1f{cmd_end}:%d:%s\x1f' "$rc" "$PWD"
    printf '\x1f{cmd_start}\x1f'
}}
PROMPT_COMMAND="__shellcoach_prompt_cmd"

# Block dangerous commands
{blocked_funcs}

# Prevent accidental Ctrl+D shell exit
set -o ignoreeof

# No history file in sandbox
unset HISTFILE

cd "{sandbox_root}"
"#,
        sandbox_root = sandbox_root,
        user = user,
        hostname = hostname,
        cmd_start = CMD_START,
        cmd_end = CMD_END,
        blocked_funcs = blocked_funcs,
    )
}
